use crate::combine::{ContextCombiner, ErrorCombiner, Logger};
use crate::context::Context;
use crate::error::StepError;
use crate::event::{EventHandler, SharedEventBus};
use crate::state::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Type-safe step name wrapper.
///
/// # Examples
///
/// ```
/// use kumitate::StepName;
///
/// let name = StepName::new("CreateVolume");
/// assert_eq!(name.as_str(), "CreateVolume");
///
/// let name: StepName = "AttachVolume".into();
/// assert_eq!(name.to_string(), "AttachVolume");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Identity and lifecycle state of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    /// The step's name.
    pub name: StepName,
    /// The step's current lifecycle state.
    pub state: State,
}

impl StepInfo {
    /// Creates the info of a step that has never run.
    pub fn new(name: impl Into<StepName>) -> Self {
        Self {
            name: name.into(),
            state: State::None,
        }
    }
}

/// The closed set of step variants traversal utilities distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// A [`GenericStep`](crate::GenericStep) used directly as a marker.
    Generic,
    /// A [`SequentialStep`](crate::SequentialStep).
    Sequential,
    /// A [`ParallelStep`](crate::ParallelStep).
    Parallel,
    /// Any user-defined terminal step.
    Leaf,
}

/// Invoked with the outgoing context after a step succeeds.
pub type SuccessFn = Arc<dyn Fn(&Context, &StepInfo) + Send + Sync>;

/// Invoked with the combined error after a step fails or is cancelled.
pub type FailFn = Arc<dyn Fn(&Context, &StepInfo, &StepError) + Send + Sync>;

/// A composite step's own compensating action.
pub type RollbackFn = Arc<dyn Fn(&Context) -> Result<(), StepError> + Send + Sync>;

/// A unit of work with lifecycle state, run/rollback behavior and optional children.
///
/// Implement this trait for terminal (leaf) steps. Composite behavior is
/// provided by [`SequentialStep`](crate::SequentialStep) and
/// [`ParallelStep`](crate::ParallelStep).
///
/// A step must be in [`State::None`] before its first `run`; running the
/// same instance twice is a caller error.
///
/// # Examples
///
/// ```
/// use kumitate::prelude::*;
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct Reserve {
///     info: StepInfo,
/// }
///
/// #[async_trait]
/// impl Step for Reserve {
///     async fn run(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
///         self.info.state = State::Completed;
///         Ok(ctx.with_value("reservation", 7u32))
///     }
///
///     async fn rollback(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
///         Ok(ctx)
///     }
///
///     fn info(&self) -> &StepInfo {
///         &self.info
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Runs the step and returns the context to hand to whatever runs next.
    async fn run(&mut self, ctx: Context, bus: SharedEventBus) -> Result<Context, StepError>;

    /// Compensates for a previous successful `run`.
    async fn rollback(&mut self, ctx: Context, bus: SharedEventBus) -> Result<Context, StepError>;

    /// Returns the step's identity and current state.
    fn info(&self) -> &StepInfo;

    /// Returns the child steps, in order. Empty for leaves.
    fn steps(&self) -> &[Box<dyn Step>] {
        &[]
    }

    /// Replaces the logger this step (and its descendants) log through.
    fn set_logger(&mut self, _logger: Logger) {}

    /// Returns the variant tag used by traversal.
    fn kind(&self) -> StepKind {
        StepKind::Leaf
    }
}

/// Construction-time configuration shared by generic and composite steps.
///
/// Every field is optional; omitted fields fall back to the defaults of
/// [`resolve_logger`](crate::resolve_logger), [`ContextCombiner`],
/// [`ErrorCombiner`] and [`EventHandler`].
#[derive(Debug, Clone, Default)]
pub struct StepOpts {
    /// Logger for the step and, for composites, all descendants.
    pub logger: Option<Logger>,
    /// Reduces the contexts returned by children.
    pub context_combiner: Option<ContextCombiner>,
    /// Reduces the errors returned by children.
    pub error_combiner: Option<ErrorCombiner>,
    /// Subscribed to the event bus when the step starts running.
    pub event_handler: Option<EventHandler>,
}

/// Returns the direct children of `step` matching `pred`.
pub fn filter<'a, P>(step: &'a dyn Step, pred: P) -> Vec<&'a dyn Step>
where
    P: Fn(&dyn Step) -> bool,
{
    step.steps()
        .iter()
        .map(|child| child.as_ref())
        .filter(|child| pred(*child))
        .collect()
}

/// Searches a step tree for steps matching `pred`.
///
/// Returns nothing if `step` itself does not match. Only sequential steps
/// are descended, since at most one of their children is active at a time:
/// with `deepest` the search follows the first matching child down the tree
/// and returns the innermost match, otherwise it returns every matching
/// direct child. Any other kind of step matches as a whole.
pub fn find_steps<'a, P>(step: &'a dyn Step, pred: &P, deepest: bool) -> Vec<&'a dyn Step>
where
    P: Fn(&dyn Step) -> bool,
{
    if !pred(step) {
        return Vec::new();
    }

    match step.kind() {
        StepKind::Sequential => {
            let children = step.steps();
            if children.is_empty() {
                return vec![step];
            }
            let mut found: Vec<&'a dyn Step> = Vec::new();
            for child in children.iter().map(|c| c.as_ref()) {
                if pred(child) {
                    if deepest {
                        return find_steps(child, pred, true);
                    }
                    found.push(child);
                }
            }
            if deepest {
                found.push(step);
            }
            found
        }
        StepKind::Generic | StepKind::Parallel | StepKind::Leaf => vec![step],
    }
}

/// Returns the steps currently processing or rolling back.
pub fn active_steps(step: &dyn Step, deepest: bool) -> Vec<&dyn Step> {
    find_steps(
        step,
        &|s: &dyn Step| matches!(s.info().state, State::Processing | State::RollingBack),
        deepest,
    )
}
