use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state shared by steps and tasks.
///
/// Every step starts in [`State::None`] and only moves forward along the
/// lifecycle graph. The single backward-looking edge is
/// `Processing -> RollingBack`, taken when failure or cancellation triggers
/// compensation.
///
/// ```text
/// None -> Created -> Processing -> Completed | Failed | Canceled
///                        |
///                        +-> RollingBack -> Failed | Canceled
/// ```
///
/// # Examples
///
/// ```
/// use kumitate::State;
///
/// assert!(State::None.can_transition_to(State::Processing));
/// assert!(State::Processing.can_transition_to(State::RollingBack));
/// assert!(!State::Completed.can_transition_to(State::Processing));
/// assert_eq!(State::RollingBack.to_string(), "rollingback");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Constructed but never run.
    #[default]
    None,
    /// Registered with a task, not yet running.
    Created,
    /// Currently running.
    Processing,
    /// Running compensation after failure or cancellation.
    RollingBack,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Finished because its context was cancelled.
    Canceled,
}

impl State {
    /// Returns `true` for states with no outgoing transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed | State::Canceled)
    }

    /// Returns `true` if the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (None, Created)
                | (None, Processing)
                | (Created, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Canceled)
                | (Processing, RollingBack)
                | (RollingBack, Failed)
                | (RollingBack, Canceled)
        )
    }

    /// Returns the lowercase name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            State::None => "none",
            State::Created => "created",
            State::Processing => "processing",
            State::RollingBack => "rollingback",
            State::Completed => "completed",
            State::Failed => "failed",
            State::Canceled => "canceled",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
