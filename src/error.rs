use crate::state::State;
use crate::step::StepName;
use thiserror::Error;

/// Errors raised by the event bus or by event handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BusError {
    /// The bus was closed before the operation.
    #[error("event bus is closed")]
    Closed,

    /// A subscribed handler rejected an event.
    #[error("event handler failed: {0}")]
    Handler(String),
}

/// Errors produced while running or compensating a step tree.
///
/// Composite steps reduce any number of child errors into exactly one
/// `StepError` through their error combiner. The default combiner returns a
/// lone error unchanged and wraps two or more in [`StepError::Combined`].
///
/// # Non-Exhaustive
///
/// This enum is marked `#[non_exhaustive]`; always include a wildcard arm:
///
/// ```
/// use kumitate::{StepError, StepName};
///
/// fn describe(error: &StepError) -> String {
///     match error {
///         StepError::Failed { step_name, details } => format!("{step_name}: {details}"),
///         StepError::Canceled { step_name } => format!("{step_name} was canceled"),
///         StepError::Combined(errors) => format!("{} errors", errors.len()),
///         other => other.to_string(),
///     }
/// }
///
/// let error = StepError::Canceled { step_name: StepName::new("fanout") };
/// assert_eq!(describe(&error), "fanout was canceled");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StepError {
    /// A step's own work failed.
    #[error("step {step_name} failed: {details}")]
    Failed {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// The context shared by a step was cancelled while it ran.
    #[error("step {step_name} canceled")]
    Canceled {
        /// The name of the step that observed the cancellation.
        step_name: StepName,
    },

    /// Compensation of a step failed.
    #[error("rollback of step {step_name} failed: {details}")]
    Rollback {
        /// The name of the step whose rollback failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// A child step panicked while running concurrently.
    #[error("step {step_name} panicked: {details}")]
    Panicked {
        /// The name of the step that panicked.
        step_name: StepName,
        /// The panic message, when it was a string.
        details: String,
    },

    /// `run` was called on a step that already left [`State::None`].
    #[error("step {step_name} already ran (state: {state})")]
    AlreadyRun {
        /// The name of the step.
        step_name: StepName,
        /// The state the step was found in.
        state: State,
    },

    /// The event bus rejected an operation.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Two or more errors reduced by the default combiner.
    ///
    /// The message is the individual messages joined with `.` in the order
    /// they were received.
    #[error("{}", join_messages(.0))]
    Combined(Vec<StepError>),
}

fn join_messages(errors: &[StepError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

impl StepError {
    /// Returns `true` if this error, or any error combined into it, is a cancellation.
    pub fn is_canceled(&self) -> bool {
        self.flatten()
            .iter()
            .any(|e| matches!(e, StepError::Canceled { .. }))
    }

    /// Returns the leaf errors, expanding nested [`StepError::Combined`] values in order.
    pub fn flatten(&self) -> Vec<&StepError> {
        match self {
            StepError::Combined(errors) => errors.iter().flat_map(StepError::flatten).collect(),
            other => vec![other],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(name: &str, details: &str) -> StepError {
        StepError::Failed {
            step_name: StepName::new(name),
            details: details.to_string(),
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            failed("provision", "quota exceeded").to_string(),
            "step provision failed: quota exceeded"
        );
        let canceled = StepError::Canceled {
            step_name: StepName::new("fanout"),
        };
        assert_eq!(canceled.to_string(), "step fanout canceled");

        let already = StepError::AlreadyRun {
            step_name: StepName::new("seq"),
            state: State::Completed,
        };
        assert_eq!(already.to_string(), "step seq already ran (state: completed)");
    }

    #[test]
    fn test_combined_display_joins_with_dot() {
        let combined = StepError::Combined(vec![failed("a", "x"), failed("b", "y")]);
        assert_eq!(combined.to_string(), "step a failed: x.step b failed: y");
    }

    #[test]
    fn test_flatten_and_is_canceled() {
        let nested = StepError::Combined(vec![
            StepError::Combined(vec![failed("a", "x"), failed("b", "y")]),
            StepError::Canceled {
                step_name: StepName::new("p"),
            },
        ]);
        assert_eq!(nested.flatten().len(), 3);
        assert!(nested.is_canceled());
        assert!(!failed("a", "x").is_canceled());
    }

    #[test]
    fn test_bus_error_is_transparent() {
        let error: StepError = BusError::Closed.into();
        assert_eq!(error.to_string(), "event bus is closed");
    }
}
