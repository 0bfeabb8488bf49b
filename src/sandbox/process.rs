//! Forked worker with kernel-enforced resource limits.

use std::sync::Arc;

use super::{ExecutionOutcome, SandboxConfig};
use crate::context::CapabilityContext;
use crate::error::KernelResult;
use crate::gate::Gate;
use crate::value::Value;

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
    #[cfg(target_os = "linux")]
    {
        linux::run(gate, context, owner, config, code_unit)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (gate, context, owner, code_unit);
        ExecutionOutcome::failure(
            super::FailureKind::Internal,
            format!(
                "sandbox: process isolation unavailable on this platform (timeout {:?})",
                config.cpu_timeout
            ),
            std::time::Duration::ZERO,
        )
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    use anyhow::{anyhow, Context, Result};
    use libc::c_int;
    use serde::{Deserialize, Serialize};
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use crate::audit::{CapabilityViolation, ViolationLog};
    use crate::gate::RunBudget;
    use crate::manager::CapabilityManager;
    use crate::sandbox::{panic_message, FailureKind};

    const POLL_INTERVAL: Duration = Duration::from_millis(5);
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Debug, Serialize, Deserialize)]
    struct WorkerResponse {
        result: KernelResult<Value>,
        panicked: Option<String>,
        violations: Vec<CapabilityViolation>,
    }

    enum ChildExit {
        Exited(c_int),
        Signaled(c_int),
        TimedOut,
    }

    pub(super) fn run<F>(
        gate: &Gate,
        context: Arc<CapabilityContext>,
        owner: Arc<CapabilityContext>,
        config: &SandboxConfig,
        code_unit: F,
    ) -> ExecutionOutcome
    where
        F: FnOnce(&Gate) -> KernelResult<Value>,
    {
        let start = Instant::now();
        let mut fds: [c_int; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return internal(
                format!("sandbox: pipe failed: {}", std::io::Error::last_os_error()),
                start,
            );
        }

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return internal(format!("sandbox: fork failed: {err}"), start);
        }

        if pid == 0 {
            unsafe { libc::close(fds[0]) };
            let payload = child_main(gate, context, config, code_unit);
            let _ = write_all(fds[1], &payload);
            unsafe {
                libc::close(fds[1]);
                libc::_exit(0);
            }
        }

        unsafe { libc::close(fds[1]) };
        drop(owner);
        drop(context);

        let mut reader = unsafe { File::from_raw_fd(fds[0]) };
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let read = reader.read_to_end(&mut buf).map(|_| buf);
            let _ = tx.send(read);
        });

        let exit = match wait_with_deadline(pid, config.cpu_timeout) {
            Ok(exit) => exit,
            Err(err) => return internal(format!("{err:#}"), start),
        };
        let payload = match rx.recv_timeout(DRAIN_TIMEOUT) {
            Ok(Ok(buf)) => buf,
            _ => Vec::new(),
        };

        match exit {
            ChildExit::TimedOut => timeout(config, start),
            ChildExit::Signaled(sig) => match classify_signal(sig, payload.is_empty()) {
                FailureKind::Timeout => timeout(config, start),
                FailureKind::Memory => ExecutionOutcome::failure(
                    FailureKind::Memory,
                    format!(
                        "memory limit {} exceeded (worker terminated by signal {sig})",
                        config.memory_limit
                    ),
                    start.elapsed(),
                ),
                _ => internal(format!("sandbox: worker terminated by signal {sig}"), start),
            },
            ChildExit::Exited(code) if payload.is_empty() => internal(
                format!("sandbox: worker exited with status {code} and no response"),
                start,
            ),
            ChildExit::Exited(_) => match serde_json::from_slice::<WorkerResponse>(&payload) {
                Ok(response) => {
                    gate.audit().extend(response.violations);
                    match response.panicked {
                        Some(message) => ExecutionOutcome::failure(
                            FailureKind::Panic,
                            format!("code unit panicked: {message}"),
                            start.elapsed(),
                        ),
                        None => ExecutionOutcome::from_result(response.result, start.elapsed()),
                    }
                }
                Err(err) => internal(format!("sandbox: response decode failed: {err}"), start),
            },
        }
    }

    fn child_main<F>(
        gate: &Gate,
        context: Arc<CapabilityContext>,
        config: &SandboxConfig,
        code_unit: F,
    ) -> Vec<u8>
    where
        F: FnOnce(&Gate) -> KernelResult<Value>,
    {
        let response = match apply_limits(config) {
            Err(err) => WorkerResponse {
                result: Err(crate::error::KernelError::failed(format!("{err:#}"))),
                panicked: None,
                violations: Vec::new(),
            },
            Ok(()) => {
                let local_audit = Arc::new(ViolationLog::new());
                let run_gate = gate.detached(
                    Arc::new(RunBudget::new(config.cpu_timeout)),
                    local_audit.clone(),
                );
                let caught = CapabilityManager::with_context(context, || {
                    panic::catch_unwind(AssertUnwindSafe(|| code_unit(&run_gate)))
                });
                let (result, panicked) = match caught {
                    Ok(result) => (result, None),
                    Err(payload) => (
                        Err(crate::error::KernelError::failed("panic")),
                        Some(panic_message(payload)),
                    ),
                };
                WorkerResponse {
                    result,
                    panicked,
                    violations: local_audit.violations(),
                }
            }
        };
        serde_json::to_vec(&response).unwrap_or_default()
    }

    /// Only the deadline kill is ours for certain; `SIGXCPU` comes from our
    /// `RLIMIT_CPU`. Any other `SIGKILL` is the kernel reclaiming memory.
    fn classify_signal(sig: c_int, payload_empty: bool) -> FailureKind {
        match sig {
            libc::SIGXCPU => FailureKind::Timeout,
            libc::SIGKILL => FailureKind::Memory,
            libc::SIGABRT | libc::SIGSEGV | libc::SIGBUS if payload_empty => FailureKind::Memory,
            _ => FailureKind::Internal,
        }
    }

    /// Address-space budget on top of what the forked image already maps,
    /// plus a hard CPU-seconds cap.
    fn apply_limits(config: &SandboxConfig) -> Result<()> {
        let baseline = mapped_bytes().unwrap_or(0);
        let address_space = baseline.saturating_add(config.memory_limit.as_u64());
        set_limit(libc::RLIMIT_AS, address_space, address_space)
            .context("sandbox: RLIMIT_AS failed")?;

        let cpu_secs = config.cpu_timeout.as_secs() + u64::from(config.cpu_timeout.subsec_nanos() > 0);
        set_limit(libc::RLIMIT_CPU, cpu_secs.max(1), cpu_secs.max(1) + 1)
            .context("sandbox: RLIMIT_CPU failed")?;
        Ok(())
    }

    #[cfg(target_env = "gnu")]
    type Resource = libc::__rlimit_resource_t;
    #[cfg(not(target_env = "gnu"))]
    type Resource = c_int;

    fn set_limit(resource: Resource, soft: u64, hard: u64) -> Result<()> {
        let limit = libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        };
        let rc = unsafe { libc::setrlimit(resource, &limit) };
        if rc != 0 {
            return Err(anyhow!(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn mapped_bytes() -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().next()?.parse().ok()?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(page_size).ok().map(|size| pages * size)
    }

    fn wait_with_deadline(pid: libc::pid_t, timeout: Duration) -> Result<ChildExit> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut status: c_int = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rc == pid {
                if libc::WIFEXITED(status) {
                    return Ok(ChildExit::Exited(libc::WEXITSTATUS(status)));
                }
                if libc::WIFSIGNALED(status) {
                    return Ok(ChildExit::Signaled(libc::WTERMSIG(status)));
                }
                continue;
            }
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(anyhow!(err)).context("sandbox: waitpid failed");
            }
            if Instant::now() >= deadline {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    libc::waitpid(pid, &mut status, 0);
                }
                return Ok(ChildExit::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn write_all(fd: c_int, buf: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let rc = unsafe {
                libc::write(
                    fd,
                    buf[offset..].as_ptr() as *const libc::c_void,
                    buf.len() - offset,
                )
            };
            if rc <= 0 {
                return Err(anyhow!("sandbox: failed to write response"));
            }
            offset += rc as usize;
        }
        Ok(())
    }

    fn timeout(config: &SandboxConfig, start: Instant) -> ExecutionOutcome {
        ExecutionOutcome::failure(
            FailureKind::Timeout,
            format!("timeout after {:?}", config.cpu_timeout),
            start.elapsed(),
        )
    }

    fn internal(message: String, start: Instant) -> ExecutionOutcome {
        log::error!("{message}");
        ExecutionOutcome::failure(FailureKind::Internal, message, start.elapsed())
    }

}
