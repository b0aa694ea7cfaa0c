//! Aggregation policies used by composite steps, and their defaults.

use crate::context::Context;
use crate::error::StepError;
use std::fmt;
use std::sync::Arc;

/// Structured logger handed from a task to every step in its tree.
pub type Logger = tracing::Span;

/// Returns `logger`, or the span current at the call site when none is given.
pub fn resolve_logger(logger: Option<Logger>) -> Logger {
    logger.unwrap_or_else(tracing::Span::current)
}

/// Reduces the contexts returned by child steps into one outgoing context.
///
/// The default keeps the first context of the sequence. Returning `None`
/// makes the step fall back to the context it was started with.
///
/// # Examples
///
/// ```
/// use kumitate::{Context, ContextCombiner};
///
/// let a = Context::new().with_value("from", "a");
/// let b = Context::new().with_value("from", "b");
///
/// let first = ContextCombiner::default().combine(&[a.clone(), b.clone()]);
/// assert_eq!(first.and_then(|c| c.value::<&str>("from").copied()), Some("a"));
///
/// let last = ContextCombiner::last().combine(&[a, b]);
/// assert_eq!(last.and_then(|c| c.value::<&str>("from").copied()), Some("b"));
/// ```
#[derive(Clone)]
pub struct ContextCombiner(Arc<dyn Fn(&[Context]) -> Option<Context> + Send + Sync>);

impl ContextCombiner {
    /// Wraps a closure as a context combiner.
    pub fn new<F>(combine: F) -> Self
    where
        F: Fn(&[Context]) -> Option<Context> + Send + Sync + 'static,
    {
        Self(Arc::new(combine))
    }

    /// Keeps the first context.
    pub fn first() -> Self {
        Self::new(|contexts| contexts.first().cloned())
    }

    /// Keeps the last context, which for a sequence carries everything
    /// threaded through it.
    pub fn last() -> Self {
        Self::new(|contexts| contexts.last().cloned())
    }

    /// Applies the combiner.
    pub fn combine(&self, contexts: &[Context]) -> Option<Context> {
        (self.0)(contexts)
    }
}

impl Default for ContextCombiner {
    fn default() -> Self {
        Self::first()
    }
}

impl fmt::Debug for ContextCombiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextCombiner")
    }
}

/// Reduces any number of errors into at most one.
///
/// The default returns `None` for no errors, the error itself for exactly
/// one, and a [`StepError::Combined`] in arrival order otherwise. Errors
/// coming from concurrent children arrive in completion order, which is not
/// deterministic; supply a custom combiner when the order matters.
///
/// # Examples
///
/// ```
/// use kumitate::{ErrorCombiner, StepError, StepName};
///
/// let e1 = StepError::Canceled { step_name: StepName::new("a") };
/// let e2 = StepError::Canceled { step_name: StepName::new("b") };
/// let combiner = ErrorCombiner::default();
///
/// assert_eq!(combiner.combine(vec![]), None);
/// assert_eq!(combiner.combine(vec![e1.clone()]), Some(e1.clone()));
/// assert_eq!(
///     combiner.combine(vec![e1, e2]).map(|e| e.to_string()),
///     Some("step a canceled.step b canceled".to_string())
/// );
/// ```
#[derive(Clone)]
pub struct ErrorCombiner(Arc<dyn Fn(Vec<StepError>) -> Option<StepError> + Send + Sync>);

impl ErrorCombiner {
    /// Wraps a closure as an error combiner.
    pub fn new<F>(combine: F) -> Self
    where
        F: Fn(Vec<StepError>) -> Option<StepError> + Send + Sync + 'static,
    {
        Self(Arc::new(combine))
    }

    /// Joins the errors in arrival order.
    pub fn join() -> Self {
        Self::new(|mut errors| match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(StepError::Combined(errors)),
        })
    }

    /// Applies the combiner.
    pub fn combine(&self, errors: Vec<StepError>) -> Option<StepError> {
        (self.0)(errors)
    }
}

impl Default for ErrorCombiner {
    fn default() -> Self {
        Self::join()
    }
}

impl fmt::Debug for ErrorCombiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorCombiner")
    }
}
