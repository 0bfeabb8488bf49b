use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use capability_kernel::{
    ByteSize, CapabilityContext, CapabilityManager, CapabilityToken, CapabilityType,
    FailureKind, FunctionSecurityMetadata, Gate, Isolation, KernelError,
    ResourceLimit, Sandbox, SandboxConfig, TrustedCatalog, Value, ViolationLog,
};

fn sandbox() -> Sandbox {
    let catalog = TrustedCatalog::builder("job")
        .library(
            "net",
            "net.get",
            FunctionSecurityMetadata::requires(["network.http"]).with_resource_arg(0),
            |_, _| Ok(Value::str("200 OK")),
        )
        .library(
            "time",
            "time.now",
            FunctionSecurityMetadata::safe(),
            |_, _| Ok(Value::Int(0)),
        )
        .build()
        .expect("catalog");
    Sandbox::new(Gate::new(catalog, Arc::new(ViolationLog::new())))
}

fn granted(caps: &[&str]) -> Arc<CapabilityContext> {
    let mut ctx = CapabilityContext::root("job");
    for c in caps {
        ctx.add_capability(CapabilityToken::unconstrained(*c));
    }
    ctx.into_shared()
}

fn config(isolation: Isolation, timeout: Duration) -> SandboxConfig {
    SandboxConfig {
        cpu_timeout: timeout,
        isolation,
        ..SandboxConfig::default()
    }
}

#[test]
fn successful_run_returns_value() {
    let outcome = sandbox().run(
        |gate| gate.call("net.get", &[Value::str("https://example.org")]),
        granted(&["network.http"]),
        &SandboxConfig::default(),
    );
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.value, Some(Value::str("200 OK")));
    assert!(outcome.error.is_none());
}

#[test]
fn context_is_active_only_inside_the_run() {
    let outcome = sandbox().run(
        |_| {
            let ctx = CapabilityManager::current()
                .ok_or_else(|| KernelError::failed("no active context"))?;
            Ok(Value::str(ctx.name()))
        },
        granted(&[]),
        &SandboxConfig::default(),
    );
    assert_eq!(outcome.value, Some(Value::str("job")));
    assert!(!CapabilityManager::is_active());
}

#[test]
fn capability_failure_is_reported_and_audited() {
    let sandbox = sandbox();
    let outcome = sandbox.run(
        |gate| gate.call("net.get", &[Value::str("https://evil.example")]),
        granted(&[]),
        &SandboxConfig::default(),
    );
    assert!(!outcome.success);
    assert_eq!(outcome.failure_kind(), Some(FailureKind::Capability));
    assert!(matches!(
        outcome.kernel_error(),
        Some(KernelError::Capability { .. })
    ));

    let violations = sandbox.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].capability_type.as_str(), "network.http");
    assert_eq!(
        violations[0].resource.as_deref(),
        Some("https://evil.example")
    );
}

#[test]
fn thread_run_times_out_at_next_gate_call() {
    let start = Instant::now();
    let outcome = sandbox().run(
        |gate| loop {
            gate.call("time.now", &[])?;
            std::thread::sleep(Duration::from_millis(1));
        },
        granted(&[]),
        &config(Isolation::Thread, Duration::from_millis(100)),
    );
    assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn nothing_is_authorized_after_a_thread_timeout() {
    let (tx, rx) = mpsc::channel();
    let outcome = sandbox().run(
        move |gate| {
            // Pure computation: no gate call until well past the deadline.
            let spin_until = Instant::now() + Duration::from_millis(400);
            while Instant::now() < spin_until {
                std::hint::spin_loop();
            }
            let context = CapabilityManager::current().map(|c| c.name().to_string());
            let call = gate.call("net.get", &[Value::str("https://late")]);
            let resource = gate.require_resource(
                &CapabilityType::new("network.http"),
                "https://late",
                "net.get",
            );
            let _ = tx.send((context, call, resource.map(|_| ())));
            Ok(Value::Unit)
        },
        granted(&["network.http"]),
        &config(Isolation::Thread, Duration::from_millis(100)),
    );
    assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));

    let (context, call, resource) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker reports");
    let exhausted = KernelError::ResourceLimit(ResourceLimit::Timeout);
    assert_eq!(context, None);
    assert_eq!(call.unwrap_err(), exhausted);
    assert_eq!(resource.unwrap_err(), exhausted);
}

#[test]
fn nul_in_context_name_does_not_abort_the_run() {
    let ctx = CapabilityContext::root("a\0b").into_shared();
    let outcome = sandbox().run(
        |_| {
            let ctx = CapabilityManager::current()
                .ok_or_else(|| KernelError::failed("no active context"))?;
            Ok(Value::str(ctx.name()))
        },
        ctx,
        &config(Isolation::Thread, Duration::from_secs(5)),
    );
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.value, Some(Value::str("a\0b")));
}

#[test]
fn panic_in_code_unit_is_contained() {
    let outcome = sandbox().run(
        |_| panic!("generated code bug"),
        granted(&[]),
        &SandboxConfig::default(),
    );
    assert_eq!(outcome.failure_kind(), Some(FailureKind::Panic));
    let message = &outcome.error.as_ref().unwrap().message;
    assert!(message.contains("generated code bug"));
    assert!(!CapabilityManager::is_active());
}

#[test]
fn disabled_security_grants_everything_for_that_run_only() {
    let sandbox = sandbox();
    let ctx = granted(&[]);
    let open = SandboxConfig {
        security_enabled: false,
        ..SandboxConfig::default()
    };

    let outcome = sandbox.run(
        |gate| gate.call("net.get", &[Value::str("https://x")]),
        ctx.clone(),
        &open,
    );
    assert!(outcome.success, "{:?}", outcome.error);

    let outcome = sandbox.run(
        |gate| gate.call("net.get", &[Value::str("https://x")]),
        ctx.clone(),
        &SandboxConfig::default(),
    );
    assert_eq!(outcome.failure_kind(), Some(FailureKind::Capability));
    assert!(ctx.is_empty());
}

#[test]
fn invalid_config_is_rejected_before_running() {
    let bad = SandboxConfig {
        memory_limit: ByteSize::bytes(10),
        ..SandboxConfig::default()
    };
    let outcome = sandbox().run(|_| Ok(Value::Unit), granted(&[]), &bad);
    assert_eq!(outcome.failure_kind(), Some(FailureKind::Internal));
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod process {
    use super::*;
    use capability_kernel::CapabilityViolation;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn process_run_returns_value() {
        let outcome = sandbox().run(
            |gate| gate.call("net.get", &[Value::str("https://example.org")]),
            granted(&["network.http"]),
            &config(Isolation::Process, Duration::from_secs(5)),
        );
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.value, Some(Value::str("200 OK")));
    }

    #[test]
    fn process_run_is_killed_on_timeout() {
        let start = Instant::now();
        let outcome = sandbox().run(
            |_| {
                let mut n: u64 = 0;
                loop {
                    n = std::hint::black_box(n.wrapping_add(1));
                }
            },
            granted(&[]),
            &config(Isolation::Process, Duration::from_millis(300)),
        );
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn process_run_enforces_memory_limit() {
        let limited = SandboxConfig {
            memory_limit: ByteSize::mib(16),
            ..config(Isolation::Process, Duration::from_secs(5))
        };
        let outcome = sandbox().run(
            |_| {
                let mut hog: Vec<Vec<u8>> = Vec::new();
                for _ in 0..64 {
                    hog.push(vec![1u8; 8 * 1024 * 1024]);
                }
                Ok(Value::Int(hog.len() as i64))
            },
            granted(&[]),
            &limited,
        );
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Memory));
    }

    #[test]
    fn process_violations_reach_the_parent_log() {
        let sandbox = sandbox();
        let outcome = sandbox.run(
            |gate| gate.call("net.get", &[Value::str("https://blocked")]),
            granted(&[]),
            &config(Isolation::Process, Duration::from_secs(5)),
        );
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Capability));
        let violations = sandbox.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].operation, "net.get");
        sandbox.audit().verify_chain().expect("chain intact");
    }

    #[test]
    fn busy_parent_audit_log_does_not_stall_workers() {
        let sandbox = sandbox();
        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let audit = sandbox.audit().clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    audit.append(CapabilityViolation::now(
                        CapabilityType::new("noise"),
                        None,
                        "writer",
                    ));
                }
            })
        };

        for _ in 0..10 {
            let outcome = sandbox.run(
                |gate| gate.call("net.get", &[Value::str("https://blocked")]),
                granted(&[]),
                &config(Isolation::Process, Duration::from_secs(5)),
            );
            assert_eq!(outcome.failure_kind(), Some(FailureKind::Capability));
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();

        let blocked = sandbox
            .violations()
            .into_iter()
            .filter(|v| v.operation == "net.get")
            .count();
        assert_eq!(blocked, 10);
        sandbox.audit().verify_chain().expect("chain intact");
    }
}
