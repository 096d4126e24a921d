//! Control handlers, capabilities and the body-side operation context.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::ControlError;

/// The three control calls an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// `pause()`
    Pause,
    /// `resume()`
    Resume,
    /// `cancel()`
    Cancel,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Native implementation of one control call, supplied by an operation body.
///
/// Returning `Ok(())` lets the dispatcher apply the transition; an error is
/// handed back unchanged to whoever called the control method.
///
/// Any `Fn() -> impl Future<Output = Result<(), ControlError<E>>>` closure is
/// a handler.
#[async_trait]
pub trait ControlHandler<E>: Send + Sync {
    /// Runs the handler.
    async fn handle(&self) -> Result<(), ControlError<E>>;
}

#[async_trait]
impl<E, F, Fut> ControlHandler<E> for F
where
    E: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ControlError<E>>> + Send + 'static,
{
    async fn handle(&self) -> Result<(), ControlError<E>> {
        (self)().await
    }
}

/// How an operation answers one kind of control call.
pub enum Capability<E> {
    /// No native support: wait for the body to settle (pause, cancel) or
    /// succeed immediately (resume).
    Deferred,
    /// Delegate to a handler.
    Handler(Arc<dyn ControlHandler<E>>),
}

impl<E> Clone for Capability<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Deferred => Self::Deferred,
            Self::Handler(handler) => Self::Handler(Arc::clone(handler)),
        }
    }
}

impl<E> fmt::Debug for Capability<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deferred => f.write_str("Deferred"),
            Self::Handler(_) => f.write_str("Handler"),
        }
    }
}

pub(crate) struct ControlSet<E> {
    pause: Capability<E>,
    resume: Capability<E>,
    cancel: Capability<E>,
}

impl<E> ControlSet<E> {
    fn new() -> Self {
        Self {
            pause: Capability::Deferred,
            resume: Capability::Deferred,
            cancel: Capability::Deferred,
        }
    }

    fn slot(&mut self, kind: ControlKind) -> &mut Capability<E> {
        match kind {
            ControlKind::Pause => &mut self.pause,
            ControlKind::Resume => &mut self.resume,
            ControlKind::Cancel => &mut self.cancel,
        }
    }
}

type Listener<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Ordered listener list. Listeners are called outside the lock so they may
/// register further listeners.
pub(crate) struct ProgressHub<P> {
    listeners: Mutex<Vec<Listener<P>>>,
}

impl<P> ProgressHub<P> {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener<P>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn publish(&self, stats: &P) {
        let snapshot = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            listener(stats);
        }
    }
}

/// Body-side view of an operation.
///
/// The body reports progress through it and may install control handlers
/// after it has started. Installing replaces the previous capability.
pub struct OperationContext<E, P> {
    controls: Arc<Mutex<ControlSet<E>>>,
    hub: Arc<ProgressHub<P>>,
}

impl<E, P> Clone for OperationContext<E, P> {
    fn clone(&self) -> Self {
        Self {
            controls: Arc::clone(&self.controls),
            hub: Arc::clone(&self.hub),
        }
    }
}

impl<E, P> OperationContext<E, P> {
    pub(crate) fn new() -> Self {
        Self {
            controls: Arc::new(Mutex::new(ControlSet::new())),
            hub: Arc::new(ProgressHub::new()),
        }
    }

    pub(crate) fn hub(&self) -> &Arc<ProgressHub<P>> {
        &self.hub
    }

    pub(crate) fn capability(&self, kind: ControlKind) -> Capability<E> {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slot(kind)
            .clone()
    }

    /// Multicasts `stats` to every registered listener, in registration order.
    pub fn progress(&self, stats: &P) {
        self.hub.publish(stats);
    }

    /// Installs the capability used for `kind`.
    pub fn install(&self, kind: ControlKind, capability: Capability<E>) {
        *self
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slot(kind) = capability;
    }

    /// Installs a pause handler.
    pub fn on_pause(&self, handler: impl ControlHandler<E> + 'static) {
        self.install(ControlKind::Pause, Capability::Handler(Arc::new(handler)));
    }

    /// Installs a resume handler.
    pub fn on_resume(&self, handler: impl ControlHandler<E> + 'static) {
        self.install(ControlKind::Resume, Capability::Handler(Arc::new(handler)));
    }

    /// Installs a cancel handler.
    pub fn on_cancel(&self, handler: impl ControlHandler<E> + 'static) {
        self.install(ControlKind::Cancel, Capability::Handler(Arc::new(handler)));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Never;

    #[test]
    fn test_progress_listeners_called_in_registration_order() {
        let ctx: OperationContext<Never, u64> = OperationContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let seen = Arc::clone(&seen);
            ctx.hub()
                .subscribe(Arc::new(move |value: &u64| seen.lock().unwrap().push((id, *value))));
        }
        ctx.progress(&7);

        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_capability_defaults_to_deferred() {
        let ctx: OperationContext<Never, ()> = OperationContext::new();
        assert!(matches!(
            ctx.capability(ControlKind::Pause),
            Capability::Deferred
        ));
        assert!(matches!(
            ctx.capability(ControlKind::Cancel),
            Capability::Deferred
        ));
    }

    #[tokio::test]
    async fn test_closure_installed_as_handler() {
        let ctx: OperationContext<Never, ()> = OperationContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        ctx.on_resume(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ControlError<Never>>(())
            }
        });

        let Capability::Handler(handler) = ctx.capability(ControlKind::Resume) else {
            panic!("expected an installed handler");
        };
        handler.handle().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
