//! Per-thread active capability context.
//!
//! The register is thread-local: a context activated on one thread is never
//! visible on another. Activation is scoped through [`ContextGuard`], whose
//! drop restores the previous value on every exit path, unwinding included.
//! An activation may also be tied to a [`Revocation`]; once revoked, the
//! context stops being visible even though the guard has not dropped yet.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::CapabilityContext;

struct Activation {
    ctx: Arc<CapabilityContext>,
    revocation: Option<Revocation>,
}

impl Activation {
    fn visible(&self) -> Option<Arc<CapabilityContext>> {
        match &self.revocation {
            Some(r) if r.is_revoked() => None,
            _ => Some(self.ctx.clone()),
        }
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<Activation>> = const { RefCell::new(None) };
}

static ACTIVATIONS: AtomicU64 = AtomicU64::new(0);

/// Shared switch that withdraws an activation from another thread.
#[derive(Clone, Debug, Default)]
pub struct Revocation(Arc<AtomicBool>);

impl Revocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Restores the previously active context when dropped.
///
/// Not `Send`: it must be dropped on the thread that created it.
#[must_use = "the context is deactivated as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<Activation>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // try_with: the slot may already be gone during thread teardown.
        let _ = ACTIVE.try_with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}

/// Process-wide facade over the thread-local register.
pub struct CapabilityManager;

impl CapabilityManager {
    /// Run `body` with `ctx` active on the calling thread.
    pub fn with_context<R>(ctx: Arc<CapabilityContext>, body: impl FnOnce() -> R) -> R {
        let _guard = Self::activate(ctx);
        body()
    }

    /// Install `ctx` until the returned guard is dropped.
    pub fn activate(ctx: Arc<CapabilityContext>) -> ContextGuard {
        Self::install(ctx, None)
    }

    /// Like [`CapabilityManager::activate`], but `revocation` can withdraw
    /// the context early from any thread. Nested activations inherit it.
    pub fn activate_revocable(ctx: Arc<CapabilityContext>, revocation: Revocation) -> ContextGuard {
        Self::install(ctx, Some(revocation))
    }

    fn install(ctx: Arc<CapabilityContext>, revocation: Option<Revocation>) -> ContextGuard {
        log::trace!("activating capability context '{}'", ctx.name());
        let previous = ACTIVE.with(|slot| {
            let mut slot = slot.borrow_mut();
            let inherited = slot.as_ref().and_then(|a| a.revocation.clone());
            slot.replace(Activation {
                ctx,
                revocation: revocation.or(inherited),
            })
        });
        ACTIVATIONS.fetch_add(1, Ordering::Relaxed);
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Active context, or `None` when nothing is active or it was revoked.
    pub fn current() -> Option<Arc<CapabilityContext>> {
        ACTIVE
            .try_with(|slot| slot.borrow().as_ref().and_then(Activation::visible))
            .ok()
            .flatten()
    }

    pub fn is_active() -> bool {
        Self::current().is_some()
    }

    /// Total activations across all threads since process start.
    pub fn activation_count() -> u64 {
        ACTIVATIONS.load(Ordering::Relaxed)
    }
}
