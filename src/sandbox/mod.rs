//! Sandboxed execution of one unit of generated code.
//!
//! The wrapper selects a worker (thread or forked process), activates the
//! capability context on that worker only, runs the unit under a CPU/wall
//! deadline and a memory bound, and turns whatever happened into an
//! [`ExecutionOutcome`]. Context deactivation is tied to a drop guard on the
//! worker, so it happens on normal return, error and panic alike.

mod process;
mod thread;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::{CapabilityViolation, ViolationLog};
use crate::capability::CapabilityToken;
use crate::context::CapabilityContext;
use crate::error::{KernelError, KernelResult, ResourceLimit};
use crate::gate::Gate;
use crate::value::Value;

pub const DEFAULT_CPU_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MEMORY_LIMIT: ByteSize = ByteSize::mib(256);
pub const MIN_MEMORY_LIMIT: ByteSize = ByteSize::mib(1);

/// Memory amount in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    pub const fn bytes(n: u64) -> Self {
        Self(n)
    }

    pub const fn kib(n: u64) -> Self {
        Self(n * 1024)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n * 1024 * 1024)
    }

    pub const fn gib(n: u64) -> Self {
        Self(n * 1024 * 1024 * 1024)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Parses `1048576`, `512KiB`, `64MiB`, `1GiB` (also `KB`/`MB`/`GB`, `K`/`M`/`G`).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (digits, unit) = raw.split_at(split);
        let n: u64 = digits
            .parse()
            .map_err(|_| anyhow!("invalid byte size '{}'", raw))?;
        let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            other => return Err(anyhow!("unknown byte size unit '{}' in '{}'", other, raw)),
        };
        n.checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| anyhow!("byte size '{}' overflows", raw))
    }
}

impl std::fmt::Display for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const GIB: u64 = 1024 * 1024 * 1024;
        const MIB: u64 = 1024 * 1024;
        const KIB: u64 = 1024;
        match self.0 {
            n if n >= GIB && n % GIB == 0 => write!(f, "{}GiB", n / GIB),
            n if n >= MIB && n % MIB == 0 => write!(f, "{}MiB", n / MIB),
            n if n >= KIB && n % KIB == 0 => write!(f, "{}KiB", n / KIB),
            n => write!(f, "{}B", n),
        }
    }
}

/// Worker used to host a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Dedicated thread. On timeout the context is revoked and gate calls
    /// fail; a unit that never calls the gate keeps its thread until it
    /// returns (see [`Sandbox::detached_workers`]).
    #[default]
    Thread,
    /// Forked child with rlimits; timeouts kill the child.
    ///
    /// The child of a multi-threaded parent may only rely on state it owns:
    /// it records violations in a private log and reports them over the
    /// pipe. Locks held by other parent threads at fork time (a logger's
    /// output lock, for one) stay held in the child, so a child that blocks
    /// on one is killed at the deadline and reported as a timeout.
    Process,
}

impl Isolation {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "thread" | "threads" => Ok(Self::Thread),
            "process" | "fork" | "subprocess" => Ok(Self::Process),
            other => Err(anyhow!(
                "unsupported isolation '{}'; expected 'thread' or 'process'",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    pub cpu_timeout: Duration,
    pub memory_limit: ByteSize,
    /// When false the run gets a universal token. Explicit and logged.
    pub security_enabled: bool,
    pub isolation: Isolation,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cpu_timeout: DEFAULT_CPU_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            security_enabled: true,
            isolation: Isolation::Thread,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_timeout.is_zero() {
            return Err(anyhow!("sandbox cpu_timeout must be greater than zero"));
        }
        if self.memory_limit < MIN_MEMORY_LIMIT {
            return Err(anyhow!(
                "sandbox memory_limit must be at least {}",
                MIN_MEMORY_LIMIT
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Type,
    Security,
    Capability,
    ResourceDenied,
    Timeout,
    Memory,
    Panic,
    Failed,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Type => "type",
            Self::Security => "security",
            Self::Capability => "capability",
            Self::ResourceDenied => "resource_denied",
            Self::Timeout => "timeout",
            Self::Memory => "memory",
            Self::Panic => "panic",
            Self::Failed => "failed",
            Self::Internal => "internal",
        }
    }
}

impl From<&KernelError> for FailureKind {
    fn from(err: &KernelError) -> Self {
        match err {
            KernelError::Type { .. } => Self::Type,
            KernelError::Security { .. } => Self::Security,
            KernelError::Capability { .. } => Self::Capability,
            KernelError::ResourceDenied { .. } => Self::ResourceDenied,
            KernelError::ResourceLimit(ResourceLimit::Timeout) => Self::Timeout,
            KernelError::ResourceLimit(ResourceLimit::Memory) => Self::Memory,
            KernelError::Failed { .. } => Self::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: FailureKind,
    pub message: String,
    /// Set when the run ended with a kernel error (not a panic or worker fault).
    pub source: Option<KernelError>,
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<ExecutionError>,
    pub elapsed: Duration,
}

impl ExecutionOutcome {
    pub(crate) fn from_result(result: KernelResult<Value>, elapsed: Duration) -> Self {
        match result {
            Ok(value) => Self {
                success: true,
                value: Some(value),
                error: None,
                elapsed,
            },
            Err(err) => Self {
                success: false,
                value: None,
                error: Some(ExecutionError {
                    kind: FailureKind::from(&err),
                    message: err.to_string(),
                    source: Some(err),
                }),
                elapsed,
            },
        }
    }

    pub(crate) fn failure(kind: FailureKind, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(ExecutionError {
                kind,
                message: message.into(),
                source: None,
            }),
            elapsed,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Kernel error behind a failed outcome, if it came from the gate or the unit.
    pub fn kernel_error(&self) -> Option<&KernelError> {
        self.error.as_ref().and_then(|e| e.source.as_ref())
    }
}

/// Hosts sandboxed runs against one catalog and audit log.
#[derive(Clone)]
pub struct Sandbox {
    gate: Gate,
}

impl Sandbox {
    pub fn new(gate: Gate) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn violations(&self) -> Vec<CapabilityViolation> {
        self.gate.audit().violations()
    }

    pub fn audit(&self) -> &Arc<ViolationLog> {
        self.gate.audit()
    }

    /// Thread-mode workers that outlived their timeout and are still running.
    /// Their contexts are already revoked.
    pub fn detached_workers() -> usize {
        thread::detached_workers()
    }

    /// Run `code_unit` with `context` active for exactly its duration.
    pub fn run<F>(
        &self,
        code_unit: F,
        context: Arc<CapabilityContext>,
        config: &SandboxConfig,
    ) -> ExecutionOutcome
    where
        F: FnOnce(&Gate) -> KernelResult<Value> + Send + 'static,
    {
        if let Err(err) = config.validate() {
            return ExecutionOutcome::failure(FailureKind::Internal, format!("{err:#}"), Duration::ZERO);
        }
        let effective = effective_context(&context, config);
        log::debug!(
            "sandbox run start: context='{}' isolation={:?} timeout={:?} memory={}",
            effective.name(),
            config.isolation,
            config.cpu_timeout,
            config.memory_limit
        );
        let start = Instant::now();
        let mut outcome = match config.isolation {
            Isolation::Thread => thread::run(&self.gate, effective, context, config, code_unit),
            Isolation::Process => process::run(&self.gate, effective, context, config, code_unit),
        };
        outcome.elapsed = start.elapsed();
        match outcome.failure_kind() {
            Some(FailureKind::Timeout) | Some(FailureKind::Memory) => log::warn!(
                "sandbox run exhausted: {} after {:?}",
                outcome.error.as_ref().map_or("", |e| e.message.as_str()),
                outcome.elapsed
            ),
            _ => log::debug!(
                "sandbox run finished: success={} elapsed={:?}",
                outcome.success,
                outcome.elapsed
            ),
        }
        outcome
    }
}

/// With security disabled, wrap the caller's context in a child holding the
/// universal token. The caller's context itself is never modified.
fn effective_context(
    context: &Arc<CapabilityContext>,
    config: &SandboxConfig,
) -> Arc<CapabilityContext> {
    if config.security_enabled {
        return context.clone();
    }
    log::warn!(
        "security disabled: granting universal capability to run under context '{}'",
        context.name()
    );
    CapabilityContext::new(format!("{}+unrestricted", context.name()), Some(context))
        .with_capability(CapabilityToken::universal())
        .into_shared()
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}
