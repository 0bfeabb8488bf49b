//! Kernel error taxonomy.
//!
//! Every admission decision and every sandboxed run surfaces one of these.
//! Errors never get swallowed inside the kernel; the sandbox is the only
//! place that turns them into an [`ExecutionOutcome`](crate::sandbox::ExecutionOutcome).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::CapabilityType;

pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Resource bound tripped by the sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLimit {
    Timeout,
    Memory,
}

impl ResourceLimit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Memory => "memory",
        }
    }
}

impl std::fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum KernelError {
    /// Attempted to invoke something that is not callable. Codegen defect.
    #[error("type error: {message}")]
    Type { message: String },

    /// No authorization path exists for the symbol.
    #[error(
        "security error: call to '{symbol}' (from {origin}) is not allowed; allowed call sources: {}",
        allowed_sources.join(", ")
    )]
    Security {
        symbol: String,
        origin: String,
        allowed_sources: Vec<String>,
    },

    /// Registered, capability-gated function called without the grants it needs.
    #[error(
        "capability error: '{symbol}' requires [{}]; held: [{}]",
        join_types(missing),
        join_types(held)
    )]
    Capability {
        symbol: String,
        missing: Vec<CapabilityType>,
        held: Vec<CapabilityType>,
    },

    /// A function implementation rejected a concrete resource.
    #[error("resource denied: '{resource}' is outside the '{capability}' grant")]
    ResourceDenied {
        capability: CapabilityType,
        resource: String,
    },

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(ResourceLimit),

    /// Error raised by a function body itself.
    #[error("{message}")]
    Failed { message: String },
}

impl KernelError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// True for denials produced by the enforcement layer.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::Security { .. } | Self::Capability { .. } | Self::ResourceDenied { .. }
        )
    }
}

fn join_types(types: &[CapabilityType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
