//! Error types for controllable operations.
//!
//! Two families exist:
//! - [`OperationError`] is what awaiting an operation yields when it does not
//!   complete: either it was canceled on request or its body failed.
//! - [`ControlError`] is what a `pause()`, `resume()` or `cancel()` call
//!   yields when the control transition could not be applied.

use std::sync::Arc;

use thiserror::Error;

/// Failure delivered to every awaiter of an operation.
///
/// Body failures are shared behind an [`Arc`] because the same reason is
/// handed to the main awaiter and to any control call waiting on the body.
#[derive(Debug, Error)]
pub enum OperationError<E> {
    /// The operation was canceled by request.
    #[error("operation was canceled")]
    Canceled,

    /// The operation body failed.
    #[error("{0}")]
    Failed(Arc<E>),

    /// The task driving the operation stopped without settling it.
    #[error("operation stopped without settling")]
    Aborted,
}

impl<E> OperationError<E> {
    /// Returns true when the operation ended because cancellation was requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns the body failure, if this is one.
    #[must_use]
    pub fn failure(&self) -> Option<&E> {
        match self {
            Self::Failed(source) => Some(source.as_ref()),
            Self::Canceled | Self::Aborted => None,
        }
    }
}

impl<E> Clone for OperationError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Canceled => Self::Canceled,
            Self::Failed(source) => Self::Failed(Arc::clone(source)),
            Self::Aborted => Self::Aborted,
        }
    }
}

// Lets operation bodies use `?` on their own error type.
impl<E> From<E> for OperationError<E> {
    fn from(source: E) -> Self {
        Self::Failed(Arc::new(source))
    }
}

/// Errors returned by `pause()`, `resume()` and `cancel()`.
#[derive(Debug, Error)]
pub enum ControlError<E> {
    /// Another control call has not finished yet.
    #[error("operation in progress")]
    InProgress,

    /// The operation was already canceled.
    #[error("operation was canceled")]
    Canceled,

    /// The operation already completed or failed.
    #[error("operation was settled")]
    Settled,

    /// The cancel handler succeeded, but the operation settled on its own meanwhile.
    #[error("operation was settled during cancel handler")]
    SettledDuringCancel,

    /// A pause, resume or cancel handler refused the transition.
    #[error("control handler failed: {0}")]
    Rejected(Arc<E>),

    /// The operation failed while this control call waited for it to settle.
    #[error("operation failed during control call: {0}")]
    Failed(OperationError<E>),
}

impl<E> ControlError<E> {
    /// Creates a handler rejection from a domain error.
    pub fn rejected(source: E) -> Self {
        Self::Rejected(Arc::new(source))
    }

    /// Returns true for state-machine misuse that the caller may retry later.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::Canceled | Self::Settled | Self::SettledDuringCancel
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("disk on fire")]
    struct Boom;

    #[test]
    fn test_operation_error_from_body_error() {
        let error: OperationError<Boom> = Boom.into();
        assert_eq!(error.failure(), Some(&Boom));
        assert!(!error.is_canceled());
        assert_eq!(error.to_string(), "disk on fire");
    }

    #[test]
    fn test_operation_error_clone_shares_reason() {
        let error: OperationError<Boom> = Boom.into();
        let cloned = error.clone();
        match (error, cloned) {
            (OperationError::Failed(a), OperationError::Failed(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("unexpected pair: {other:?}"),
        }
    }

    #[test]
    fn test_control_error_precondition_messages() {
        assert_eq!(
            ControlError::<Boom>::InProgress.to_string(),
            "operation in progress"
        );
        assert_eq!(
            ControlError::<Boom>::Canceled.to_string(),
            "operation was canceled"
        );
        assert_eq!(
            ControlError::<Boom>::Settled.to_string(),
            "operation was settled"
        );
        assert!(ControlError::<Boom>::SettledDuringCancel.is_precondition());
    }

    #[test]
    fn test_control_error_rejected_is_not_precondition() {
        let error = ControlError::rejected(Boom);
        assert!(!error.is_precondition());
        assert!(error.to_string().contains("disk on fire"));
    }
}
