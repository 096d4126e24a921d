//! The task that owns an operation's state.
//!
//! Each operation is driven by exactly one dispatcher. It polls the body,
//! consumes control commands from a channel and holds at most one in-flight
//! control call, so overlapping controls are rejected by construction.

use std::future::{Future, poll_fn};
use std::pin::pin;
use std::task::Poll;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use super::control::{Capability, ControlKind, OperationContext};
use super::{ControlError, OperationError, OperationState, Status};

type Reply<E> = oneshot::Sender<Result<(), ControlError<E>>>;

/// A control call sent from an [`super::Operation`] handle.
pub(crate) struct Command<E> {
    pub(crate) kind: ControlKind,
    pub(crate) reply: Reply<E>,
}

enum InFlight<E> {
    /// A handler future is running.
    Handler {
        kind: ControlKind,
        reply: Reply<E>,
        future: BoxFuture<'static, Result<(), ControlError<E>>>,
    },
    /// A handler-less pause or cancel waiting for the body to settle.
    Waiting { kind: ControlKind, reply: Reply<E> },
}

enum Event<T, E> {
    HandlerDone(Result<(), ControlError<E>>),
    Tick,
    Command(Option<Command<E>>),
    Body(Result<T, OperationError<E>>),
}

pub(crate) struct Dispatcher<T, E, P> {
    context: OperationContext<E, P>,
    status: watch::Sender<Status<T, E>>,
    state: OperationState,
    in_flight: Option<InFlight<E>>,
    /// Body result waiting for the next tick, or for `resume()` while paused.
    withheld: Option<T>,
    /// The body reported cancellation while a cancel handler was running.
    held_cancel: bool,
}

impl<T, E, P> Dispatcher<T, E, P>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn new(context: OperationContext<E, P>, status: watch::Sender<Status<T, E>>) -> Self {
        Self {
            context,
            status,
            state: OperationState::Running,
            in_flight: None,
            withheld: None,
            held_cancel: false,
        }
    }

    pub(crate) async fn run<F>(mut self, mut inbox: mpsc::UnboundedReceiver<Command<E>>, body: F)
    where
        F: Future<Output = Result<T, OperationError<E>>>,
    {
        let mut body = pin!(body);
        let mut body_done = false;
        let mut inbox_open = true;

        loop {
            let handler_running = matches!(self.in_flight, Some(InFlight::Handler { .. }));
            let tick_due = self.tick_due();

            if self.in_flight.is_none() {
                if self.state.is_terminal() {
                    break;
                }
                // Nobody is left to resume a withheld result.
                if body_done && !inbox_open && !tick_due {
                    break;
                }
            }

            let event = tokio::select! {
                biased;
                result = poll_handler(&mut self.in_flight), if handler_running => Event::HandlerDone(result),
                () = tokio::task::yield_now(), if tick_due => Event::Tick,
                command = inbox.recv(), if inbox_open => Event::Command(command),
                output = &mut body, if !body_done => Event::Body(output),
                else => break,
            };

            match event {
                Event::HandlerDone(result) => self.on_handler_done(result),
                Event::Tick => self.on_tick(),
                Event::Command(Some(command)) => self.on_command(command),
                Event::Command(None) => inbox_open = false,
                Event::Body(output) => {
                    body_done = true;
                    self.on_body(output);
                }
            }
        }
        trace!(state = ?self.state, "dispatcher finished");
    }

    fn tick_due(&self) -> bool {
        self.withheld.is_some() && self.state == OperationState::Running
    }

    fn on_command(&mut self, command: Command<E>) {
        let Command { kind, reply } = command;

        if self.in_flight.is_some() {
            let _ = reply.send(Err(ControlError::InProgress));
            return;
        }
        if self.state.is_terminal() {
            let _ = reply.send(Err(self.terminal_error()));
            return;
        }
        if matches!(
            (kind, self.state),
            (ControlKind::Pause, OperationState::Paused) | (ControlKind::Resume, OperationState::Running)
        ) {
            let _ = reply.send(Ok(()));
            return;
        }

        match self.context.capability(kind) {
            Capability::Handler(handler) => {
                debug!(%kind, "running control handler");
                let future = Box::pin(async move { handler.handle().await });
                self.in_flight = Some(InFlight::Handler {
                    kind,
                    reply,
                    future,
                });
            }
            Capability::Deferred => match kind {
                ControlKind::Resume => {
                    self.transition(OperationState::Running);
                    let _ = reply.send(Ok(()));
                }
                ControlKind::Pause | ControlKind::Cancel if self.withheld.is_some() => {
                    self.settle_waiter(kind, reply);
                }
                ControlKind::Pause | ControlKind::Cancel => {
                    self.in_flight = Some(InFlight::Waiting { kind, reply });
                }
            },
        }
    }

    fn on_handler_done(&mut self, result: Result<(), ControlError<E>>) {
        let Some(InFlight::Handler { kind, reply, .. }) = self.in_flight.take() else {
            return;
        };

        let outcome = match result {
            Err(error) => {
                debug!(%kind, error_kind = control_error_kind(&error), "control handler failed");
                if self.held_cancel {
                    self.cancel_now();
                }
                Err(error)
            }
            Ok(()) => match kind {
                ControlKind::Cancel => match self.state {
                    OperationState::Completed | OperationState::Failed => {
                        Err(ControlError::SettledDuringCancel)
                    }
                    OperationState::Canceled => Ok(()),
                    OperationState::Running | OperationState::Paused => {
                        self.cancel_now();
                        Ok(())
                    }
                },
                ControlKind::Pause | ControlKind::Resume if self.state.is_terminal() => {
                    Err(self.terminal_error())
                }
                ControlKind::Pause => {
                    self.transition(OperationState::Paused);
                    Ok(())
                }
                ControlKind::Resume => {
                    self.transition(OperationState::Running);
                    Ok(())
                }
            },
        };
        let _ = reply.send(outcome);
    }

    fn on_body(&mut self, output: Result<T, OperationError<E>>) {
        match output {
            Ok(value) => {
                if let Some((kind, reply)) = self.take_waiting() {
                    self.settle_waiter(kind, reply);
                }
                if self.state != OperationState::Canceled {
                    self.withheld = Some(value);
                }
            }
            Err(OperationError::Canceled) => {
                if matches!(
                    self.in_flight,
                    Some(InFlight::Handler {
                        kind: ControlKind::Cancel,
                        ..
                    })
                ) {
                    self.held_cancel = true;
                    return;
                }
                let waiter = self.take_waiting();
                self.cancel_now();
                if let Some((kind, reply)) = waiter {
                    let outcome = if kind == ControlKind::Cancel {
                        Ok(())
                    } else {
                        Err(ControlError::Canceled)
                    };
                    let _ = reply.send(outcome);
                }
            }
            Err(error) => {
                let waiter = self.take_waiting();
                self.finish(OperationState::Failed, Err(error.clone()));
                if let Some((_, reply)) = waiter {
                    let _ = reply.send(Err(ControlError::Failed(error)));
                }
            }
        }
    }

    fn on_tick(&mut self) {
        if self.state != OperationState::Running {
            return;
        }
        if let Some(value) = self.withheld.take() {
            self.finish(OperationState::Completed, Ok(value));
        }
    }

    /// Answers a handler-less pause or cancel once the body has resolved.
    fn settle_waiter(&mut self, kind: ControlKind, reply: Reply<E>) {
        match kind {
            ControlKind::Pause => self.transition(OperationState::Paused),
            ControlKind::Cancel => self.cancel_now(),
            ControlKind::Resume => {}
        }
        let _ = reply.send(Ok(()));
    }

    fn take_waiting(&mut self) -> Option<(ControlKind, Reply<E>)> {
        match self.in_flight.take() {
            Some(InFlight::Waiting { kind, reply }) => Some((kind, reply)),
            other => {
                self.in_flight = other;
                None
            }
        }
    }

    fn cancel_now(&mut self) {
        self.held_cancel = false;
        self.withheld = None;
        self.finish(OperationState::Canceled, Err(OperationError::Canceled));
    }

    fn terminal_error(&self) -> ControlError<E> {
        if self.state == OperationState::Canceled {
            ControlError::Canceled
        } else {
            ControlError::Settled
        }
    }

    fn transition(&mut self, state: OperationState) {
        debug!(from = ?self.state, to = ?state, "operation state changed");
        self.state = state;
        self.status.send_modify(|status| status.state = state);
    }

    fn finish(&mut self, state: OperationState, outcome: Result<T, OperationError<E>>) {
        debug!(from = ?self.state, to = ?state, "operation settled");
        self.state = state;
        self.status.send_modify(|status| {
            status.state = state;
            status.outcome = Some(outcome);
        });
    }
}

fn poll_handler<E>(
    in_flight: &mut Option<InFlight<E>>,
) -> impl Future<Output = Result<(), ControlError<E>>> + '_ {
    poll_fn(move |cx| match in_flight {
        Some(InFlight::Handler { future, .. }) => future.as_mut().poll(cx),
        _ => Poll::Pending,
    })
}

fn control_error_kind<E>(error: &ControlError<E>) -> &'static str {
    match error {
        ControlError::InProgress => "in_progress",
        ControlError::Canceled => "canceled",
        ControlError::Settled => "settled",
        ControlError::SettledDuringCancel => "settled_during_cancel",
        ControlError::Rejected(_) => "rejected",
        ControlError::Failed(_) => "failed",
    }
}
