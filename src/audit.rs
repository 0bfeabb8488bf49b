//! Append-only record of enforcement denials.
//!
//! Records are hash-chained (SHA-256 over the previous head and the entry
//! payload) so tampering with the in-memory log is detectable. The log is
//! observability only; it is never consulted for authorization.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::capability::CapabilityType;

const GENESIS_HASH: [u8; 32] = [0u8; 32];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityViolation {
    pub capability_type: CapabilityType,
    pub resource: Option<String>,
    pub operation: String,
    pub timestamp: SystemTime,
}

impl CapabilityViolation {
    pub fn now(
        capability_type: CapabilityType,
        resource: Option<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            capability_type,
            resource,
            operation: operation.into(),
            timestamp: SystemTime::now(),
        }
    }

    fn payload(&self) -> Vec<u8> {
        let since_epoch = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(self.capability_type.as_str().as_bytes());
        out.push(0);
        if let Some(resource) = &self.resource {
            out.extend_from_slice(resource.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(self.operation.as_bytes());
        out.push(0);
        out.extend_from_slice(&since_epoch.as_secs().to_le_bytes());
        out.extend_from_slice(&since_epoch.subsec_nanos().to_le_bytes());
        out
    }
}

/// Hashes an entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Default)]
struct Chain {
    entries: Vec<CapabilityViolation>,
    hashes: Vec<[u8; 32]>,
}

impl Chain {
    fn head(&self) -> [u8; 32] {
        self.hashes.last().copied().unwrap_or(GENESIS_HASH)
    }
}

/// Concurrent, append-only violation log.
#[derive(Default)]
pub struct ViolationLog {
    chain: Mutex<Chain>,
}

impl ViolationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, violation: CapabilityViolation) {
        log::debug!(
            "capability violation: {} on {} (resource: {})",
            violation.capability_type,
            violation.operation,
            violation.resource.as_deref().unwrap_or("-")
        );
        let mut chain = self.lock();
        let hash = hash_entry(&chain.head(), &violation.payload());
        chain.entries.push(violation);
        chain.hashes.push(hash);
    }

    pub fn extend(&self, violations: impl IntoIterator<Item = CapabilityViolation>) {
        for v in violations {
            self.append(v);
        }
    }

    /// Snapshot of every record, oldest first.
    pub fn violations(&self) -> Vec<CapabilityViolation> {
        self.lock().entries.clone()
    }

    /// Position to pass to [`ViolationLog::since`] later.
    pub fn mark(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn since(&self, mark: usize) -> Vec<CapabilityViolation> {
        let chain = self.lock();
        chain.entries.get(mark..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head_hash(&self) -> [u8; 32] {
        self.lock().head()
    }

    pub fn head_hash_hex(&self) -> String {
        hex::encode(self.head_hash())
    }

    /// Recompute the chain from genesis and compare every stored hash.
    pub fn verify_chain(&self) -> Result<()> {
        let chain = self.lock();
        let mut prev = GENESIS_HASH;
        for (idx, (entry, stored)) in chain.entries.iter().zip(&chain.hashes).enumerate() {
            let expected = hash_entry(&prev, &entry.payload());
            if &expected != stored {
                return Err(anyhow!("violation log hash mismatch at entry {}", idx));
            }
            prev = expected;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn tamper(&self, idx: usize, operation: &str) {
        self.lock().entries[idx].operation = operation.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn violation(op: &str) -> CapabilityViolation {
        CapabilityViolation::now(CapabilityType::new("file.read"), None, op)
    }

    #[test]
    fn chain_verifies_after_appends() {
        let log = ViolationLog::new();
        assert_eq!(log.head_hash(), GENESIS_HASH);
        log.append(violation("a"));
        log.append(violation("b"));
        assert_eq!(log.len(), 2);
        assert_ne!(log.head_hash(), GENESIS_HASH);
        log.verify_chain().unwrap();
    }

    #[test]
    fn tampering_is_detected() {
        let log = ViolationLog::new();
        log.append(violation("a"));
        log.append(violation("b"));
        log.tamper(0, "rewritten");
        let err = log.verify_chain().unwrap_err();
        assert!(err.to_string().contains("entry 0"));
    }

    #[test]
    fn since_returns_only_new_records() {
        let log = ViolationLog::new();
        log.append(violation("old"));
        let mark = log.mark();
        log.append(violation("new"));
        let fresh = log.since(mark);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].operation, "new");
        assert!(log.since(99).is_empty());
    }

    #[test]
    fn concurrent_appends_are_all_kept() {
        let log = Arc::new(ViolationLog::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        log.append(violation(&format!("t{i}-{j}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 200);
        log.verify_chain().unwrap();
    }
}
