use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

use super::{panic_message, ExecutionOutcome, FailureKind, SandboxConfig};
use crate::context::CapabilityContext;
use crate::error::KernelResult;
use crate::gate::{Gate, RunBudget};
use crate::manager::{CapabilityManager, Revocation};
use crate::value::Value;

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const ABANDONED: u8 = 2;

/// Workers whose run timed out and which have not returned yet.
static DETACHED: AtomicUsize = AtomicUsize::new(0);

pub(super) fn detached_workers() -> usize {
    DETACHED.load(Ordering::SeqCst)
}

/// Host the unit on a dedicated thread.
///
/// A thread cannot be killed. On timeout the activation is revoked, so the
/// worker sees no context from then on, and the run's budget is cancelled,
/// so every later gate call fails. The caller gets the timeout outcome
/// immediately; the worker is counted in [`detached_workers`] until it
/// returns. `memory_limit` is not enforceable per thread.
pub(super) fn run<F>(
    gate: &Gate,
    context: Arc<CapabilityContext>,
    owner: Arc<CapabilityContext>,
    config: &SandboxConfig,
    code_unit: F,
) -> ExecutionOutcome
where
    F: FnOnce(&Gate) -> KernelResult<Value> + Send + 'static,
{
    log::debug!(
        "thread isolation: memory_limit {} is advisory only",
        config.memory_limit
    );
    let start = Instant::now();
    let budget = Arc::new(RunBudget::new(config.cpu_timeout));
    let revocation = Revocation::new();
    let state = Arc::new(AtomicU8::new(RUNNING));
    let run_gate = gate.with_budget(budget.clone());
    let (tx, rx) = mpsc::channel();

    let worker_revocation = revocation.clone();
    let worker_state = state.clone();
    let spawned = std::thread::Builder::new()
        .name(thread_name(context.name()))
        .spawn(move || {
            // Keeps weak parent links of `context` alive for the whole run.
            let _owner = owner;
            let result = {
                let _guard = CapabilityManager::activate_revocable(context, worker_revocation);
                panic::catch_unwind(AssertUnwindSafe(|| code_unit(&run_gate)))
            };
            if worker_state
                .compare_exchange(RUNNING, FINISHED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                DETACHED.fetch_sub(1, Ordering::SeqCst);
                log::debug!("detached sandbox worker returned");
            }
            let _ = tx.send(result);
        });
    if let Err(err) = spawned {
        return ExecutionOutcome::failure(
            FailureKind::Internal,
            format!("sandbox: failed to spawn worker thread: {err}"),
            start.elapsed(),
        );
    }

    match rx.recv_timeout(config.cpu_timeout) {
        Ok(Ok(result)) => ExecutionOutcome::from_result(result, start.elapsed()),
        Ok(Err(payload)) => ExecutionOutcome::failure(
            FailureKind::Panic,
            format!("code unit panicked: {}", panic_message(payload)),
            start.elapsed(),
        ),
        Err(RecvTimeoutError::Timeout) => {
            revocation.revoke();
            budget.cancel();
            DETACHED.fetch_add(1, Ordering::SeqCst);
            if state
                .compare_exchange(RUNNING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Finished in the meantime; nothing is left running.
                DETACHED.fetch_sub(1, Ordering::SeqCst);
            } else {
                log::warn!(
                    "sandbox worker still running after {:?}; context revoked, worker detached",
                    config.cpu_timeout
                );
            }
            ExecutionOutcome::failure(
                FailureKind::Timeout,
                format!("timeout after {:?}", config.cpu_timeout),
                start.elapsed(),
            )
        }
        Err(RecvTimeoutError::Disconnected) => ExecutionOutcome::failure(
            FailureKind::Internal,
            "sandbox: worker exited without a result",
            start.elapsed(),
        ),
    }
}

/// Thread names may not contain NUL; context names come from callers.
fn thread_name(context: &str) -> String {
    format!("sandbox:{}", context.replace('\0', "\u{fffd}"))
}
