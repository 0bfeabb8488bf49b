//! Capability Kernel
//!
//! Final trust boundary for code compiled from an untrusted, sandboxed source
//! language. Generated code may try to call anything; only calls that are
//! statically registered as safe, or authorized by a capability token in the
//! active context, are allowed to run. Everything else fails loudly.
//!
//! # Architecture
//!
//! The kernel enforces these invariants by construction:
//!
//! 1. **Deny by default**: a callee with no authorization path is refused.
//! 2. **Explicit grants**: only tokens handed to the kernel by the issuer
//!    satisfy a capability requirement; tokens never change after creation.
//! 3. **Scoped activation**: a context is active on exactly one thread for
//!    exactly one scope and is always deactivated when the scope ends.
//! 4. **Thread isolation**: no thread observes another thread's context.
//! 5. **Bounded runs**: every sandboxed unit runs under a time and memory bound.
//!
//! # Module Structure
//!
//! - `capability`: tokens, constraints and resource patterns
//! - `context`: hierarchical capability contexts
//! - `manager`: thread-local active context and scoped activation
//! - `catalog`: build-time registry of callable symbols and their metadata
//! - `gate`: the `safe_call` admission checkpoint
//! - `audit`: append-only, hash-chained violation log
//! - `sandbox`: resource-bounded execution of one code unit
//! - `config`: TOML settings and capability grants

pub mod audit;
pub mod capability;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod manager;
pub mod sandbox;
pub mod value;

pub use audit::{CapabilityViolation, ViolationLog};
pub use capability::{CapabilityConstraint, CapabilityToken, CapabilityType, ResourcePattern};
pub use catalog::{
    CatalogBuilder, ClassSpec, FunctionSecurityMetadata, Origin, TrustedCatalog,
};
pub use config::{Grant, KernelSettings};
pub use context::CapabilityContext;
pub use error::{KernelError, KernelResult, ResourceLimit};
pub use gate::{Gate, RunBudget, MAX_CALL_DEPTH};
pub use manager::{CapabilityManager, ContextGuard, Revocation};
pub use sandbox::{
    ByteSize, ExecutionError, ExecutionOutcome, FailureKind, Isolation, Sandbox, SandboxConfig,
};
pub use value::{BoundMethod, Object, Value, ValueKind};
