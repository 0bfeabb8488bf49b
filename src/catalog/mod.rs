//! Trusted catalog of callable symbols.
//!
//! The catalog is populated once, through [`CatalogBuilder`], during startup
//! and is immutable afterwards. Each entry records where a symbol comes from
//! and, for library symbols, the capabilities it requires. The gate trusts
//! these registrations to be accurate and never derives capabilities itself.

pub mod primitives;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::CapabilityType;
use crate::error::KernelResult;
use crate::gate::Gate;
use crate::value::Value;

pub type NativeFn = Arc<dyn Fn(&Gate, &[Value]) -> KernelResult<Value> + Send + Sync>;
pub type NativeMethod = Arc<dyn Fn(&Gate, &Value, &[Value]) -> KernelResult<Value> + Send + Sync>;

/// Capabilities a registered function requires at call time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionSecurityMetadata {
    pub required_capabilities: Vec<CapabilityType>,
    /// Argument carrying the resource identifier. Only used to annotate
    /// audit records; resource matching is the implementation's job.
    pub resource_arg: Option<usize>,
}

impl FunctionSecurityMetadata {
    /// Metadata with no requirements: explicitly registered as safe.
    pub fn safe() -> Self {
        Self::default()
    }

    pub fn requires<I, C>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CapabilityType>,
    {
        let mut required: Vec<CapabilityType> = Vec::new();
        for c in capabilities {
            let c = c.into();
            if !required.contains(&c) {
                required.push(c);
            }
        }
        Self {
            required_capabilities: required,
            resource_arg: None,
        }
    }

    pub fn with_resource_arg(mut self, idx: usize) -> Self {
        self.resource_arg = Some(idx);
        self
    }
}

/// Where a symbol was defined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The trusted top-level program module of the current compilation unit.
    Program(String),
    /// Any other module (library, stdlib, import).
    Module(String),
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Program(name) => write!(f, "program module '{}'", name),
            Self::Module(name) => write!(f, "module '{}'", name),
        }
    }
}

pub struct FunctionEntry {
    pub symbol: String,
    pub origin: Origin,
    pub metadata: Option<FunctionSecurityMetadata>,
    pub(crate) body: NativeFn,
}

impl std::fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("symbol", &self.symbol)
            .field("origin", &self.origin)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

pub struct MethodEntry {
    pub metadata: Option<FunctionSecurityMetadata>,
    pub(crate) body: NativeMethod,
}

pub struct ClassEntry {
    pub name: String,
    pub origin: Origin,
    /// Class-level trusted marking: every method may be called.
    pub trusted: bool,
    methods: HashMap<String, MethodEntry>,
}

impl ClassEntry {
    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }
}

/// Declarative description of a class for registration.
pub struct ClassSpec {
    name: String,
    module: String,
    trusted: bool,
    methods: HashMap<String, MethodEntry>,
    duplicates: Vec<String>,
}

impl ClassSpec {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            trusted: false,
            methods: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }

    pub fn method<F>(self, name: &str, body: F) -> Self
    where
        F: Fn(&Gate, &Value, &[Value]) -> KernelResult<Value> + Send + Sync + 'static,
    {
        self.insert_method(name, None, Arc::new(body))
    }

    pub fn gated_method<F>(self, name: &str, metadata: FunctionSecurityMetadata, body: F) -> Self
    where
        F: Fn(&Gate, &Value, &[Value]) -> KernelResult<Value> + Send + Sync + 'static,
    {
        self.insert_method(name, Some(metadata), Arc::new(body))
    }

    fn insert_method(
        mut self,
        name: &str,
        metadata: Option<FunctionSecurityMetadata>,
        body: NativeMethod,
    ) -> Self {
        if self.methods.contains_key(name) {
            self.duplicates.push(format!("{}.{}", self.name, name));
        } else {
            self.methods
                .insert(name.to_string(), MethodEntry { metadata, body });
        }
        self
    }
}

/// Immutable registry consulted by the gate.
pub struct TrustedCatalog {
    program_module: String,
    functions: HashMap<String, FunctionEntry>,
    classes: HashMap<String, ClassEntry>,
}

impl TrustedCatalog {
    pub fn builder(program_module: impl Into<String>) -> CatalogBuilder {
        CatalogBuilder::new(program_module)
    }

    pub fn program_module(&self) -> &str {
        &self.program_module
    }

    pub fn function(&self, symbol: &str) -> Option<&FunctionEntry> {
        self.functions.get(symbol)
    }

    pub fn class(&self, name: &str) -> Option<&ClassEntry> {
        self.classes.get(name)
    }

    pub fn symbols(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

pub struct CatalogBuilder {
    program_module: String,
    functions: HashMap<String, FunctionEntry>,
    classes: HashMap<String, ClassEntry>,
    duplicates: Vec<String>,
}

impl CatalogBuilder {
    fn new(program_module: impl Into<String>) -> Self {
        Self {
            program_module: program_module.into(),
            functions: HashMap::new(),
            classes: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Library symbol guarded by `metadata`.
    pub fn library<F>(
        self,
        module: &str,
        symbol: &str,
        metadata: FunctionSecurityMetadata,
        body: F,
    ) -> Self
    where
        F: Fn(&Gate, &[Value]) -> KernelResult<Value> + Send + Sync + 'static,
    {
        self.insert(
            symbol,
            Origin::Module(module.to_string()),
            Some(metadata),
            Arc::new(body),
        )
    }

    /// User-authored function from the trusted program module.
    pub fn program<F>(self, symbol: &str, body: F) -> Self
    where
        F: Fn(&Gate, &[Value]) -> KernelResult<Value> + Send + Sync + 'static,
    {
        let origin = Origin::Program(self.program_module.clone());
        self.insert(symbol, origin, None, Arc::new(body))
    }

    /// Symbol known to exist but never vetted. Calls to it are denied.
    pub fn foreign<F>(self, module: &str, symbol: &str, body: F) -> Self
    where
        F: Fn(&Gate, &[Value]) -> KernelResult<Value> + Send + Sync + 'static,
    {
        self.insert(
            symbol,
            Origin::Module(module.to_string()),
            None,
            Arc::new(body),
        )
    }

    pub fn class(mut self, spec: ClassSpec) -> Self {
        self.duplicates.extend(spec.duplicates);
        if self.classes.contains_key(&spec.name) {
            self.duplicates.push(spec.name);
            return self;
        }
        let origin = if spec.module == self.program_module {
            Origin::Program(spec.module)
        } else {
            Origin::Module(spec.module)
        };
        self.classes.insert(
            spec.name.clone(),
            ClassEntry {
                name: spec.name,
                origin,
                trusted: spec.trusted,
                methods: spec.methods,
            },
        );
        self
    }

    pub fn build(self) -> Result<Arc<TrustedCatalog>> {
        if !self.duplicates.is_empty() {
            return Err(anyhow!(
                "catalog: duplicate registrations: {}",
                self.duplicates.join(", ")
            ));
        }
        log::debug!(
            "catalog built: {} functions, {} classes",
            self.functions.len(),
            self.classes.len()
        );
        Ok(Arc::new(TrustedCatalog {
            program_module: self.program_module,
            functions: self.functions,
            classes: self.classes,
        }))
    }

    fn insert(
        mut self,
        symbol: &str,
        origin: Origin,
        metadata: Option<FunctionSecurityMetadata>,
        body: NativeFn,
    ) -> Self {
        if self.functions.contains_key(symbol) {
            self.duplicates.push(symbol.to_string());
            return self;
        }
        self.functions.insert(
            symbol.to_string(),
            FunctionEntry {
                symbol: symbol.to_string(),
                origin,
                metadata,
                body,
            },
        );
        self
    }
}
