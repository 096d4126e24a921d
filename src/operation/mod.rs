//! Controllable asynchronous operations.
//!
//! An [`Operation`] wraps an async body and adds a pause/resume/cancel
//! control protocol plus progress multicast on top of its eventual result.
//!
//! # Overview
//!
//! - Bodies that know how to pause or cancel themselves install handlers
//!   (through [`OperationBuilder`] or the [`OperationContext`] they receive).
//! - Bodies without handlers still take part: a handler-less pause waits for
//!   the body to finish and withholds the result until `resume()`, and a
//!   handler-less cancel waits for the body to finish and then claims
//!   cancellation.
//! - Only one control call may be in flight; a second one fails with
//!   [`ControlError::InProgress`].
//!
//! # Example
//!
//! ```no_run
//! use patchfetch_core::operation::{Operation, OperationContext, OperationError};
//!
//! # async fn example() {
//! let op: Operation<u32, std::io::Error, u32> =
//!     Operation::new(|ctx: OperationContext<std::io::Error, u32>| async move {
//!         ctx.progress(&50);
//!         Ok::<_, OperationError<std::io::Error>>(42)
//!     });
//! op.on_progress(|percent| println!("{percent}%"));
//!
//! op.pause().await.ok();
//! op.resume().await.ok();
//! assert_eq!(op.await.ok(), Some(42));
//! # }
//! ```

mod control;
mod dispatcher;
mod error;

use std::future::{Future, IntoFuture};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};

pub use control::{Capability, ControlHandler, ControlKind, OperationContext};
pub use error::{ControlError, OperationError};

use control::ProgressHub;
use dispatcher::{Command, Dispatcher};

/// Lifecycle state of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Initial state; the body is running or its result is about to be delivered.
    Running,
    /// Paused through `pause()`.
    Paused,
    /// Canceled through `cancel()`.
    Canceled,
    /// The body failed.
    Failed,
    /// The body's result was delivered.
    Completed,
}

impl OperationState {
    /// Returns true for `Canceled`, `Failed` and `Completed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Failed | Self::Completed)
    }
}

pub(crate) struct Status<T, E> {
    state: OperationState,
    outcome: Option<Result<T, OperationError<E>>>,
}

/// Handle to a running controllable operation.
///
/// Handles are cheap to clone; every clone controls and observes the same
/// operation. Awaiting the handle (or calling [`Operation::wait`]) yields the
/// body's value or an [`OperationError`].
pub struct Operation<T, E, P = ()> {
    commands: mpsc::UnboundedSender<Command<E>>,
    status: watch::Receiver<Status<T, E>>,
    hub: Arc<ProgressHub<P>>,
}

impl<T, E, P> Clone for Operation<T, E, P> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
            hub: Arc::clone(&self.hub),
        }
    }
}

impl<T, E, P> Operation<T, E, P>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
    P: 'static,
{
    /// Spawns an operation without native control handlers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(OperationContext<E, P>) -> Fut,
        Fut: Future<Output = Result<T, OperationError<E>>> + Send + 'static,
    {
        OperationBuilder::new().spawn(body)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        self.status.borrow().state
    }

    /// Returns true once the operation is canceled, failed or completed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state().is_terminal()
    }

    /// Pauses the operation.
    ///
    /// # Errors
    ///
    /// Returns a precondition error when another control call is in flight or
    /// the operation is already terminal, the pause handler's error when it
    /// refuses, and [`ControlError::Failed`] when a handler-less pause was
    /// waiting and the body failed.
    pub async fn pause(&self) -> Result<(), ControlError<E>> {
        self.control(ControlKind::Pause).await
    }

    /// Resumes a paused operation, releasing any withheld result.
    ///
    /// # Errors
    ///
    /// Returns a precondition error when another control call is in flight or
    /// the operation is already terminal, or the resume handler's error.
    pub async fn resume(&self) -> Result<(), ControlError<E>> {
        self.control(ControlKind::Resume).await
    }

    /// Cancels the operation.
    ///
    /// # Errors
    ///
    /// Returns a precondition error when another control call is in flight or
    /// the operation is already terminal, [`ControlError::SettledDuringCancel`]
    /// when the body settled while the cancel handler ran, or the cancel
    /// handler's error.
    pub async fn cancel(&self) -> Result<(), ControlError<E>> {
        self.control(ControlKind::Cancel).await
    }

    /// Registers a progress listener. Returns `self` so calls can be chained.
    pub fn on_progress(&self, listener: impl Fn(&P) + Send + Sync + 'static) -> &Self {
        self.hub.subscribe(Arc::new(listener));
        self
    }

    /// Waits for the operation's outcome.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Canceled`] when cancellation won,
    /// [`OperationError::Failed`] with the body's error, or
    /// [`OperationError::Aborted`] if the driving task died.
    pub async fn wait(&self) -> Result<T, OperationError<E>> {
        let mut status = self.status.clone();
        match status.wait_for(|status| status.outcome.is_some()).await {
            Ok(status) => status
                .outcome
                .clone()
                .unwrap_or(Err(OperationError::Aborted)),
            Err(_) => Err(OperationError::Aborted),
        }
    }

    /// Waits until the operation is terminal without cloning its value.
    pub async fn settled(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|status| status.outcome.is_some()).await;
    }

    async fn control(&self, kind: ControlKind) -> Result<(), ControlError<E>> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command { kind, reply }).is_err() {
            return Err(self.terminal_error());
        }
        response.await.unwrap_or_else(|_| Err(self.terminal_error()))
    }

    fn terminal_error(&self) -> ControlError<E> {
        if self.state() == OperationState::Canceled {
            ControlError::Canceled
        } else {
            ControlError::Settled
        }
    }
}

impl<T, E, P> IntoFuture for Operation<T, E, P>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
    P: Send + 'static,
{
    type Output = Result<T, OperationError<E>>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

/// Configures control handlers before an operation's body starts.
pub struct OperationBuilder<E, P = ()> {
    context: OperationContext<E, P>,
}

impl<E, P> Default for OperationBuilder<E, P>
where
    E: Send + Sync + 'static,
    P: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, P> OperationBuilder<E, P>
where
    E: Send + Sync + 'static,
    P: 'static,
{
    /// Creates a builder with every control on its default strategy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            context: OperationContext::new(),
        }
    }

    /// Sets the pause handler.
    #[must_use]
    pub fn on_pause(self, handler: impl ControlHandler<E> + 'static) -> Self {
        self.context.on_pause(handler);
        self
    }

    /// Sets the resume handler.
    #[must_use]
    pub fn on_resume(self, handler: impl ControlHandler<E> + 'static) -> Self {
        self.context.on_resume(handler);
        self
    }

    /// Sets the cancel handler.
    #[must_use]
    pub fn on_cancel(self, handler: impl ControlHandler<E> + 'static) -> Self {
        self.context.on_cancel(handler);
        self
    }

    /// Returns the context the body will receive, for wiring before spawn.
    #[must_use]
    pub fn context(&self) -> OperationContext<E, P> {
        self.context.clone()
    }

    /// Starts the body on its own dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T, F, Fut>(self, body: F) -> Operation<T, E, P>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(OperationContext<E, P>) -> Fut,
        Fut: Future<Output = Result<T, OperationError<E>>> + Send + 'static,
    {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(Status {
            state: OperationState::Running,
            outcome: None,
        });
        let hub = Arc::clone(self.context.hub());
        let body = body(self.context.clone());

        tokio::spawn(Dispatcher::new(self.context, status_tx).run(inbox, body));

        Operation {
            commands,
            status,
            hub,
        }
    }
}
