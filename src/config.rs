use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{CapabilityConstraint, CapabilityToken, CapabilityType};
use crate::context::CapabilityContext;
use crate::sandbox::{ByteSize, Isolation, SandboxConfig, DEFAULT_CPU_TIMEOUT, DEFAULT_MEMORY_LIMIT};

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct KernelSettingsFile {
    sandbox: Option<SandboxConfigFile>,
    #[serde(default, rename = "grant")]
    grants: Vec<GrantFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SandboxConfigFile {
    cpu_timeout_ms: Option<u64>,
    memory_limit: Option<ByteSizeFile>,
    security_enabled: Option<bool>,
    isolation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ByteSizeFile {
    Bytes(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GrantFile {
    capability: String,
    patterns: Option<Vec<String>>,
}

/// One capability handed out by the issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub capability: CapabilityType,
    /// `None` means unconstrained.
    pub patterns: Option<Vec<String>>,
}

impl Grant {
    /// Parses the `--grant` CLI form: `cap` or `cap=pattern[,pattern...]`.
    ///
    /// `cap=` with no patterns is rejected rather than read as unconstrained.
    pub fn parse(raw: &str) -> Result<Self> {
        let (capability, patterns) = match raw.split_once('=') {
            Some((cap, patterns)) => {
                let patterns = split_csv(patterns);
                if patterns.is_empty() {
                    return Err(anyhow!(
                        "grant '{}' has an empty pattern list; drop the '=' for an unconstrained grant",
                        raw
                    ));
                }
                (cap, Some(patterns))
            }
            None => (raw, None),
        };
        let grant = Self {
            capability: CapabilityType::parse(capability)?,
            patterns,
        };
        grant.token()?;
        Ok(grant)
    }

    pub fn token(&self) -> Result<CapabilityToken> {
        let constraint = match &self.patterns {
            Some(patterns) => Some(CapabilityConstraint::parse(patterns)?),
            None => None,
        };
        Ok(CapabilityToken::new(self.capability.clone(), constraint))
    }
}

/// Sandbox knobs plus the grants issued to the root context.
#[derive(Debug, Clone, Default)]
pub struct KernelSettings {
    pub sandbox: SandboxConfig,
    pub grants: Vec<Grant>,
}

impl KernelSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
        Self::from_toml(&raw).map_err(|e| anyhow!("invalid config file {}: {:#}", path.display(), e))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: KernelSettingsFile = toml::from_str(raw)?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: KernelSettingsFile) -> Result<Self> {
        let sandbox_file = file.sandbox.unwrap_or_default();
        let cpu_timeout = sandbox_file
            .cpu_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CPU_TIMEOUT);
        let memory_limit = match sandbox_file.memory_limit {
            Some(ByteSizeFile::Bytes(n)) => ByteSize::bytes(n),
            Some(ByteSizeFile::Text(raw)) => ByteSize::parse(&raw)?,
            None => DEFAULT_MEMORY_LIMIT,
        };
        let isolation = match sandbox_file.isolation.as_deref() {
            Some(raw) => Isolation::parse(raw)?,
            None => Isolation::default(),
        };
        let sandbox = SandboxConfig {
            cpu_timeout,
            memory_limit,
            security_enabled: sandbox_file.security_enabled.unwrap_or(true),
            isolation,
        };

        let grants = file
            .grants
            .into_iter()
            .map(|g| {
                Ok(Grant {
                    capability: CapabilityType::parse(&g.capability)?,
                    patterns: g.patterns,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { sandbox, grants })
    }

    fn validate(&self) -> Result<()> {
        self.sandbox.validate()?;
        for grant in &self.grants {
            grant
                .token()
                .map_err(|e| anyhow!("grant '{}': {:#}", grant.capability, e))?;
        }
        Ok(())
    }

    /// Issue every configured grant into a fresh root context.
    pub fn root_context(&self, name: &str) -> Result<Arc<CapabilityContext>> {
        let mut ctx = CapabilityContext::root(name);
        for grant in &self.grants {
            ctx.add_capability(grant.token()?);
        }
        log::info!(
            "issued {} capability grant(s) to context '{}'",
            ctx.len(),
            name
        );
        Ok(ctx.into_shared())
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
