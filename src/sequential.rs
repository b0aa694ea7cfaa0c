use crate::combine::Logger;
use crate::context::Context;
use crate::error::StepError;
use crate::event::SharedEventBus;
use crate::generic::GenericStep;
use crate::state::State;
use crate::step::{Step, StepInfo, StepKind, StepOpts};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs its children one at a time, threading each returned context into the next child.
///
/// The first failing child stops the sequence. Children that already
/// completed are then rolled back in reverse order of completion, and the
/// failing child's error is combined with any rollback errors. The context is
/// checked for cancellation before every child; a cancelled sequence
/// compensates the same way and ends [`State::Canceled`].
///
/// # Examples
///
/// ```
/// use kumitate::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut seq = SequentialStep::new(
///     StepInfo::new("noop-sequence"),
///     StepOpts::default(),
///     vec![
///         Box::new(GenericStep::new(StepInfo::new("a"), None, Vec::new())),
///         Box::new(GenericStep::new(StepInfo::new("b"), None, Vec::new())),
///     ],
/// );
///
/// let result = seq.run(Context::new(), InMemoryEventBus::shared()).await;
/// assert!(result.is_ok());
/// assert_eq!(seq.info().state, State::Completed);
/// # }
/// ```
#[derive(Debug)]
pub struct SequentialStep {
    base: GenericStep,
    completed: usize,
}

impl SequentialStep {
    /// Creates a sequential step over `steps`, handing its logger to every child.
    pub fn new(info: StepInfo, opts: StepOpts, steps: Vec<Box<dyn Step>>) -> Self {
        let mut base = GenericStep::with_opts(info, opts, steps);
        let logger = base.logger.clone();
        base.cascade_logger(logger);
        Self { base, completed: 0 }
    }

    /// Returns the embedded base step.
    pub fn base(&self) -> &GenericStep {
        &self.base
    }

    /// Returns the embedded base step for configuring callbacks and policies.
    pub fn base_mut(&mut self) -> &mut GenericStep {
        &mut self.base
    }

    /// Rolls back the first `count` children in reverse order, collecting their errors.
    async fn unwind(
        &mut self,
        count: usize,
        contexts: &[Context],
        fallback: &Context,
        bus: &SharedEventBus,
    ) -> Vec<StepError> {
        let logger = self.base.logger.clone();
        let name = self.base.info.name.clone();
        let mut errors = Vec::new();
        for index in (0..count).rev() {
            let ctx = contexts.get(index).unwrap_or(fallback).clone();
            let Some(child) = self.base.steps.get_mut(index) else {
                continue;
            };
            debug!(
                parent: &logger,
                "step {} rolling back child {}", name, child.info().name
            );
            if let Err(e) = child.rollback(ctx, Arc::clone(bus)).await {
                warn!(
                    parent: &logger,
                    "rollback of child {} failed: {}", child.info().name, e
                );
                errors.push(e);
            }
        }
        errors
    }
}

#[async_trait]
impl Step for SequentialStep {
    async fn run(&mut self, ctx: Context, bus: SharedEventBus) -> Result<Context, StepError> {
        self.base.begin(&bus)?;

        let mut current = ctx.clone();
        let mut contexts = Vec::with_capacity(self.base.steps.len());
        let mut failure = None;
        let mut canceled = false;

        for child in self.base.steps.iter_mut() {
            if current.is_cancelled() {
                canceled = true;
                failure = Some(StepError::Canceled {
                    step_name: self.base.info.name.clone(),
                });
                break;
            }
            match child.run(current.clone(), Arc::clone(&bus)).await {
                Ok(next) => {
                    contexts.push(next.clone());
                    current = next;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.completed = contexts.len();

        let Some(failure) = failure else {
            let combined = self
                .base
                .context_combiner
                .combine(&contexts)
                .unwrap_or(current);
            self.base.succeed(&combined);
            return Ok(combined);
        };

        self.base.set_state(State::RollingBack);
        let first = failure.clone();
        let mut errors = vec![failure];
        let completed = self.completed;
        errors.extend(self.unwind(completed, &contexts, &ctx, &bus).await);
        // Children compensated here must not be compensated again by an enclosing rollback.
        self.completed = 0;
        if let Err(e) = self.base.compensate(&ctx) {
            errors.push(e);
        }

        let error = self.base.error_combiner.combine(errors).unwrap_or(first);
        let terminal = if canceled {
            State::Canceled
        } else {
            State::Failed
        };
        self.base.fail(&ctx, terminal, &error);
        Err(error)
    }

    async fn rollback(&mut self, ctx: Context, bus: SharedEventBus) -> Result<Context, StepError> {
        let completed = std::mem::take(&mut self.completed);
        let mut errors = self.unwind(completed, &[], &ctx, &bus).await;
        if let Err(e) = self.base.compensate(&ctx) {
            errors.push(e);
        }
        match self.base.error_combiner.combine(errors) {
            Some(error) => Err(error),
            None => Ok(ctx),
        }
    }

    fn info(&self) -> &StepInfo {
        &self.base.info
    }

    fn steps(&self) -> &[Box<dyn Step>] {
        &self.base.steps
    }

    fn set_logger(&mut self, logger: Logger) {
        self.base.cascade_logger(logger);
    }

    fn kind(&self) -> StepKind {
        StepKind::Sequential
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InMemoryEventBus;
    use crate::step::StepName;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug)]
    struct Counter {
        info: StepInfo,
        rollbacks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Step for Counter {
        async fn run(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
            self.info.state = State::Completed;
            Ok(ctx)
        }

        async fn rollback(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(ctx)
        }

        fn info(&self) -> &StepInfo {
            &self.info
        }
    }

    fn counters(rollbacks: &Arc<AtomicUsize>, n: usize) -> Vec<Box<dyn Step>> {
        (0..n)
            .map(|i| {
                Box::new(Counter {
                    info: StepInfo::new(format!("c{i}")),
                    rollbacks: Arc::clone(rollbacks),
                }) as Box<dyn Step>
            })
            .collect()
    }

    #[tokio::test]
    async fn test_rollback_after_success_unwinds_children_once() {
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let hook = Arc::new(AtomicUsize::new(0));
        let mut seq = SequentialStep::new(
            StepInfo::new("seq"),
            StepOpts::default(),
            counters(&rollbacks, 3),
        );
        let counter = Arc::clone(&hook);
        seq.base_mut().set_rollback_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let bus = InMemoryEventBus::shared();
        let ctx = assert_ok!(seq.run(Context::new(), Arc::clone(&bus)).await);
        assert_ok!(seq.rollback(ctx.clone(), Arc::clone(&bus)).await);
        assert_ok!(seq.rollback(ctx, bus).await);

        assert_eq!(rollbacks.load(Ordering::SeqCst), 3);
        assert_eq!(hook.load(Ordering::SeqCst), 1);
        assert_eq!(seq.info().state, State::Completed);
    }

    #[tokio::test]
    async fn test_rollback_hook_error_is_reported() {
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let mut seq = SequentialStep::new(
            StepInfo::new("seq"),
            StepOpts::default(),
            counters(&rollbacks, 1),
        );
        seq.base_mut().set_rollback_fn(|_| {
            Err(StepError::Rollback {
                step_name: StepName::new("seq"),
                details: "hook failed".to_string(),
            })
        });

        let bus = InMemoryEventBus::shared();
        let ctx = assert_ok!(seq.run(Context::new(), Arc::clone(&bus)).await);
        let error = assert_err!(seq.rollback(ctx, bus).await);

        assert_eq!(error.to_string(), "rollback of step seq failed: hook failed");
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_sequence_returns_input_context() {
        let mut seq = SequentialStep::new(StepInfo::new("empty"), StepOpts::default(), Vec::new());
        let ctx = assert_ok!(
            seq.run(Context::new().with_value("k", 7u32), InMemoryEventBus::shared())
                .await
        );
        assert_eq!(ctx.value::<u32>("k"), Some(&7));
        assert_eq!(seq.kind(), StepKind::Sequential);
    }
}
