//! Call-site enforcement gate.
//!
//! Every call emitted by generated code goes through [`Gate::safe_call`].
//! Admission rules, first match wins:
//!
//! 1. callee is not callable: type error
//! 2. callee carries [`FunctionSecurityMetadata`]: every required capability
//!    must be held by the active context, otherwise capability error
//! 3. callee is defined in the trusted program module: allowed
//! 4. bound method on a safe primitive with a vetted name: allowed
//! 5. bound method on a class marked trusted at registration: allowed
//! 6. anything else: security error
//!
//! The gate checks capability *types* only. Matching a concrete resource
//! against a token's patterns is the function implementation's job, done
//! through [`Gate::require_resource`].

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::{CapabilityViolation, ViolationLog};
use crate::capability::{CapabilityToken, CapabilityType};
use crate::catalog::primitives::{self, SAFE_PRIMITIVE_KINDS};
use crate::catalog::{ClassEntry, FunctionSecurityMetadata, Origin, TrustedCatalog};
use crate::error::{KernelError, KernelResult, ResourceLimit};
use crate::manager::CapabilityManager;
use crate::value::{BoundMethod, Value};

/// Nested gate calls allowed on one thread before the run is failed.
pub const MAX_CALL_DEPTH: usize = 256;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> KernelResult<Self> {
        let depth = CALL_DEPTH.with(|d| {
            let next = d.get() + 1;
            d.set(next);
            next
        });
        let guard = DepthGuard;
        if depth > MAX_CALL_DEPTH {
            return Err(KernelError::failed(format!(
                "maximum call depth ({MAX_CALL_DEPTH}) exceeded"
            )));
        }
        Ok(guard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Deadline and cancellation flag for one sandboxed run.
#[derive(Debug)]
pub struct RunBudget {
    deadline: Instant,
    cancelled: AtomicBool,
}

impl RunBudget {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> KernelResult<()> {
        if self.is_cancelled() {
            return Err(KernelError::ResourceLimit(ResourceLimit::Timeout));
        }
        if Instant::now() >= self.deadline {
            self.cancel();
            return Err(KernelError::ResourceLimit(ResourceLimit::Timeout));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Gate {
    catalog: Arc<TrustedCatalog>,
    audit: Arc<ViolationLog>,
    budget: Option<Arc<RunBudget>>,
}

impl Gate {
    pub fn new(catalog: Arc<TrustedCatalog>, audit: Arc<ViolationLog>) -> Self {
        Self {
            catalog,
            audit,
            budget: None,
        }
    }

    pub fn catalog(&self) -> &TrustedCatalog {
        &self.catalog
    }

    pub fn audit(&self) -> &Arc<ViolationLog> {
        &self.audit
    }

    /// Copy of this gate that enforces `budget` on every call.
    pub fn with_budget(&self, budget: Arc<RunBudget>) -> Self {
        Self {
            catalog: self.catalog.clone(),
            audit: self.audit.clone(),
            budget: Some(budget),
        }
    }

    /// Copy of this gate with its own audit log, for a forked worker that
    /// must not touch locks shared with the parent.
    pub(crate) fn detached(&self, budget: Arc<RunBudget>, audit: Arc<ViolationLog>) -> Self {
        Self {
            catalog: self.catalog.clone(),
            audit,
            budget: Some(budget),
        }
    }

    /// The single admission checkpoint for generated code.
    pub fn safe_call(&self, callee: &Value, args: &[Value]) -> KernelResult<Value> {
        if let Some(budget) = &self.budget {
            budget.check()?;
        }
        match callee {
            Value::Function(symbol) => {
                let _depth = DepthGuard::enter()?;
                self.call_function(symbol, args)
            }
            Value::Method(method) => {
                let _depth = DepthGuard::enter()?;
                self.call_method(method, args)
            }
            other => Err(KernelError::type_error(format!(
                "{} is not callable",
                other.describe()
            ))),
        }
    }

    /// Shorthand for calling a catalog symbol by name.
    pub fn call(&self, symbol: &str, args: &[Value]) -> KernelResult<Value> {
        self.safe_call(&Value::function(symbol), args)
    }

    /// Resource-pattern check for function implementations.
    ///
    /// Returns the nearest token for `capability` if it matches `resource`.
    /// On failure the denial is recorded in the audit log. An exhausted run
    /// budget fails the check before any lookup.
    pub fn require_resource(
        &self,
        capability: &CapabilityType,
        resource: &str,
        operation: &str,
    ) -> KernelResult<CapabilityToken> {
        if let Some(budget) = &self.budget {
            budget.check()?;
        }
        let token =CapabilityManager::current().and_then(|ctx| ctx.get_capability(capability, true));
        match token {
            Some(token) if token.matches(Some(resource)) => Ok(token),
            _ => {
                log::warn!(
                    "resource denied: {} on '{}' for {}",
                    capability,
                    resource,
                    operation
                );
                self.audit.append(CapabilityViolation::now(
                    capability.clone(),
                    Some(resource.to_string()),
                    operation,
                ));
                Err(KernelError::ResourceDenied {
                    capability: capability.clone(),
                    resource: resource.to_string(),
                })
            }
        }
    }

    fn call_function(&self, symbol: &str, args: &[Value]) -> KernelResult<Value> {
        let Some(entry) = self.catalog.function(symbol) else {
            return Err(self.deny(symbol, "unregistered symbol".to_string()));
        };
        if let Some(metadata) = &entry.metadata {
            self.enforce(symbol, metadata, args)?;
            return (entry.body)(self, args);
        }
        if matches!(entry.origin, Origin::Program(_)) {
            return (entry.body)(self, args);
        }
        Err(self.deny(symbol, entry.origin.to_string()))
    }

    fn call_method(&self, method: &BoundMethod, args: &[Value]) -> KernelResult<Value> {
        let receiver = method.receiver.as_ref();
        let qualified = format!("{}.{}", receiver.type_name(), method.name);

        let class: Option<&ClassEntry> = match receiver {
            Value::Object(obj) => self.catalog.class(&obj.class),
            _ => None,
        };
        let entry = class.and_then(|c| c.method(&method.name));

        if let Some(entry) = entry {
            if let Some(metadata) = &entry.metadata {
                self.enforce(&qualified, metadata, args)?;
                return (entry.body)(self, receiver, args);
            }
        }

        if let (Some(class), Some(entry)) = (class, entry) {
            if matches!(class.origin, Origin::Program(_)) {
                return (entry.body)(self, receiver, args);
            }
        }

        if primitives::is_safe_primitive(receiver.kind()) {
            if let Some(primitive) = primitives::lookup(receiver.kind(), &method.name) {
                return primitive(receiver, args);
            }
        }

        if let (Some(class), Some(entry)) = (class, entry) {
            if class.trusted {
                return (entry.body)(self, receiver, args);
            }
        }

        let origin = match (class, receiver) {
            (Some(class), _) => class.origin.to_string(),
            (None, Value::Object(_)) => "unregistered class".to_string(),
            (None, other) => format!("builtin type '{}'", other.kind()),
        };
        Err(self.deny(&qualified, origin))
    }

    fn enforce(
        &self,
        symbol: &str,
        metadata: &FunctionSecurityMetadata,
        args: &[Value],
    ) -> KernelResult<()> {
        if metadata.required_capabilities.is_empty() {
            return Ok(());
        }
        let ctx = CapabilityManager::current();
        let missing: Vec<CapabilityType> = metadata
            .required_capabilities
            .iter()
            .filter(|c| {
                !ctx.as_ref()
                    .is_some_and(|ctx| ctx.has_capability(c, None, true))
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let held = ctx
            .as_ref()
            .map(|ctx| ctx.capability_types(true))
            .unwrap_or_default();
        let resource = metadata
            .resource_arg
            .and_then(|idx| args.get(idx))
            .and_then(Value::as_str)
            .map(str::to_string);
        for capability in &missing {
            self.audit.append(CapabilityViolation::now(
                capability.clone(),
                resource.clone(),
                symbol,
            ));
        }
        log::warn!(
            "capability denied: '{}' (context: {}) missing [{}]",
            symbol,
            ctx.as_ref().map_or("<none>", |c| c.name()),
            missing
                .iter()
                .map(CapabilityType::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Err(KernelError::Capability {
            symbol: symbol.to_string(),
            missing,
            held,
        })
    }

    fn deny(&self, symbol: &str, origin: String) -> KernelError {
        log::warn!("security: blocked call to '{}' from {}", symbol, origin);
        KernelError::Security {
            symbol: symbol.to_string(),
            origin,
            allowed_sources: self.allowed_sources(),
        }
    }

    fn allowed_sources(&self) -> Vec<String> {
        let primitive_names: Vec<&str> = SAFE_PRIMITIVE_KINDS.iter().map(|k| k.as_str()).collect();
        vec![
            "registered library functions".to_string(),
            format!(
                "functions defined in program module '{}'",
                self.catalog.program_module()
            ),
            format!(
                "vetted methods of primitive types ({})",
                primitive_names.join(", ")
            ),
            "methods of trusted classes".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ClassSpec;
    use crate::context::CapabilityContext;
    use std::collections::BTreeMap;

    fn gate() -> Gate {
        let catalog = TrustedCatalog::builder("main")
            .library(
                "fs",
                "fs.read_text",
                FunctionSecurityMetadata::requires(["file.read"]).with_resource_arg(0),
                |_, args| Ok(args.first().cloned().unwrap_or(Value::Unit)),
            )
            .library(
                "math",
                "math.sqrt",
                FunctionSecurityMetadata::safe(),
                |_, _| Ok(Value::Float(2.0)),
            )
            .program("main", |gate, _| gate.call("fs.read_text", &[Value::str("/data/a")]))
            .program("recurse", |gate, _| gate.call("recurse", &[]))
            .foreign("os", "os.system", |_, _| Ok(Value::Unit))
            .class(ClassSpec::new("lib", "Point").trusted().method("norm", |_, _, _| {
                Ok(Value::Float(1.0))
            }))
            .class(ClassSpec::new("lib", "Shell").method("run", |_, _, _| Ok(Value::Unit)))
            .build()
            .unwrap();
        Gate::new(catalog, Arc::new(ViolationLog::new()))
    }

    fn ctx_with(caps: &[&str]) -> Arc<CapabilityContext> {
        let mut ctx = CapabilityContext::root("test");
        for c in caps {
            ctx.add_capability(CapabilityToken::unconstrained(*c));
        }
        ctx.into_shared()
    }

    #[test]
    fn non_callable_is_type_error() {
        let err = gate().safe_call(&Value::Int(3), &[]).unwrap_err();
        assert!(matches!(err, KernelError::Type { .. }));
        assert!(err.to_string().contains("not callable"));
    }

    #[test]
    fn gated_function_without_context_fails_and_is_audited() {
        let gate = gate();
        let err = gate
            .call("fs.read_text", &[Value::str("/data/a")])
            .unwrap_err();
        match err {
            KernelError::Capability { missing, held, .. } => {
                assert_eq!(missing, vec![CapabilityType::new("file.read")]);
                assert!(held.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        let log = gate.audit().violations();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, "fs.read_text");
        assert_eq!(log[0].resource.as_deref(), Some("/data/a"));
    }

    #[test]
    fn safe_metadata_needs_no_context() {
        assert_eq!(gate().call("math.sqrt", &[]).unwrap(), Value::Float(2.0));
    }

    #[test]
    fn program_function_is_trusted_but_nested_calls_are_checked() {
        let gate = gate();
        let err = gate.call("main", &[]).unwrap_err();
        assert!(matches!(err, KernelError::Capability { .. }));

        let ok = CapabilityManager::with_context(ctx_with(&["file.read"]), || {
            gate.call("main", &[])
        });
        assert_eq!(ok.unwrap(), Value::str("/data/a"));
    }

    #[test]
    fn foreign_and_unknown_symbols_are_denied() {
        let gate = gate();
        let err = gate.call("os.system", &[]).unwrap_err();
        match err {
            KernelError::Security { symbol, origin, .. } => {
                assert_eq!(symbol, "os.system");
                assert_eq!(origin, "module 'os'");
            }
            other => panic!("unexpected error: {other}"),
        }
        let err = gate.call("eval", &[]).unwrap_err();
        assert!(matches!(err, KernelError::Security { .. }));
        assert!(gate.audit().is_empty());
    }

    #[test]
    fn primitive_methods_follow_the_vetted_surface() {
        let gate = gate();
        let upper = Value::method(Value::str("abc"), "upper");
        assert_eq!(gate.safe_call(&upper, &[]).unwrap(), Value::str("ABC"));

        let dunder = Value::method(Value::str("abc"), "__class__");
        assert!(matches!(
            gate.safe_call(&dunder, &[]).unwrap_err(),
            KernelError::Security { .. }
        ));
    }

    #[test]
    fn trusted_class_methods_pass_untrusted_do_not() {
        let gate = gate();
        let point = Value::object("Point", BTreeMap::new());
        assert_eq!(
            gate.safe_call(&Value::method(point, "norm"), &[]).unwrap(),
            Value::Float(1.0)
        );

        let shell = Value::object("Shell", BTreeMap::new());
        let err = gate
            .safe_call(&Value::method(shell, "run"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("Shell.run"));
    }

    #[test]
    fn runaway_recursion_is_bounded() {
        let err = gate().call("recurse", &[]).unwrap_err();
        assert!(err.to_string().contains("maximum call depth"));
        assert_eq!(CALL_DEPTH.with(Cell::get), 0);
    }

    #[test]
    fn cancelled_budget_stops_calls() {
        let budget = Arc::new(RunBudget::new(Duration::from_secs(60)));
        let gate = gate().with_budget(budget.clone());
        assert!(gate.call("math.sqrt", &[]).is_ok());
        budget.cancel();
        assert_eq!(
            gate.call("math.sqrt", &[]).unwrap_err(),
            KernelError::ResourceLimit(ResourceLimit::Timeout)
        );
    }

    #[test]
    fn cancelled_budget_stops_resource_grants() {
        let budget = Arc::new(RunBudget::new(Duration::from_secs(60)));
        let gate = gate().with_budget(budget.clone());
        let file_read = CapabilityType::new("file.read");
        CapabilityManager::with_context(ctx_with(&["file.read"]), || {
            assert!(gate.require_resource(&file_read, "/data/a", "read").is_ok());
            budget.cancel();
            assert_eq!(
                gate.require_resource(&file_read, "/data/a", "read").unwrap_err(),
                KernelError::ResourceLimit(ResourceLimit::Timeout)
            );
        });
        assert!(gate.audit().is_empty());
    }
}
