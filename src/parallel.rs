use crate::combine::Logger;
use crate::context::Context;
use crate::error::StepError;
use crate::event::SharedEventBus;
use crate::generic::GenericStep;
use crate::state::State;
use crate::step::{Step, StepInfo, StepKind, StepName, StepOpts};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// What a child reports back when its spawned execution finishes.
type ChildOutcome = Result<Result<Context, StepError>, Box<dyn Any + Send>>;

/// Runs its children concurrently on the same context and fans their results in.
///
/// Every child receives the context the parallel step was started with.
/// Once all children have finished, the outcome is decided in this order:
///
/// 1. the context was cancelled: the step runs its own rollback and fails
///    with the aggregated child errors, the cancellation and any rollback
///    error combined, ending [`State::Canceled`];
/// 2. some child failed: the step fails with the combined child errors;
/// 3. otherwise the combined child contexts are returned.
///
/// Cancellation and child completion are observed through a single
/// `select!`, followed by a final check once every child has been joined,
/// so a cancellation that lands just before the last child finishes is
/// never missed. Children are not rolled back individually.
///
/// # Examples
///
/// ```
/// use kumitate::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut fanout = ParallelStep::new(
///     StepInfo::new("fanout"),
///     StepOpts::default(),
///     vec![
///         Box::new(GenericStep::new(StepInfo::new("left"), None, Vec::new())),
///         Box::new(GenericStep::new(StepInfo::new("right"), None, Vec::new())),
///     ],
/// );
///
/// let result = fanout.run(Context::new(), InMemoryEventBus::shared()).await;
/// assert!(result.is_ok());
/// assert_eq!(fanout.info().state, State::Completed);
/// # }
/// ```
#[derive(Debug)]
pub struct ParallelStep {
    base: GenericStep,
}

impl ParallelStep {
    /// Creates a parallel step over `steps`, handing its logger to every child.
    ///
    /// All steps must be in [`State::None`].
    pub fn new(info: StepInfo, opts: StepOpts, steps: Vec<Box<dyn Step>>) -> Self {
        let mut base = GenericStep::with_opts(info, opts, steps);
        let logger = base.logger.clone();
        base.cascade_logger(logger);
        Self { base }
    }

    /// Returns the embedded base step.
    pub fn base(&self) -> &GenericStep {
        &self.base
    }

    /// Returns the embedded base step for configuring callbacks and policies.
    pub fn base_mut(&mut self) -> &mut GenericStep {
        &mut self.base
    }
}

fn panic_details(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl Step for ParallelStep {
    async fn run(&mut self, ctx: Context, bus: SharedEventBus) -> Result<Context, StepError> {
        self.base.begin(&bus)?;

        let children = std::mem::take(&mut self.base.steps);
        let mut slots: Vec<Option<Box<dyn Step>>> = Vec::with_capacity(children.len());
        let mut running = JoinSet::new();
        for (index, mut child) in children.into_iter().enumerate() {
            slots.push(None);
            let ctx = ctx.clone();
            let bus = Arc::clone(&bus);
            running.spawn(async move {
                let outcome: ChildOutcome = AssertUnwindSafe(child.run(ctx, bus))
                    .catch_unwind()
                    .await;
                (index, child, outcome)
            });
        }

        let mut contexts = vec![ctx.clone()];
        let mut received_context = false;
        let mut errors = Vec::new();
        let mut canceled = false;

        loop {
            tokio::select! {
                joined = running.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((index, child, outcome)) => {
                            match outcome {
                                Ok(Ok(child_ctx)) => {
                                    contexts.push(child_ctx);
                                    received_context = true;
                                }
                                Ok(Err(e)) => errors.push(e),
                                Err(payload) => {
                                    let details = panic_details(payload.as_ref());
                                    error!(
                                        parent: &self.base.logger,
                                        "child {} of step {} panicked: {}",
                                        child.info().name, self.base.info.name, details
                                    );
                                    errors.push(StepError::Panicked {
                                        step_name: child.info().name.clone(),
                                        details,
                                    });
                                }
                            }
                            slots[index] = Some(child);
                        }
                        Err(join_error) => {
                            error!(
                                parent: &self.base.logger,
                                "lost a child of step {}: {}", self.base.info.name, join_error
                            );
                            errors.push(StepError::Failed {
                                step_name: self.base.info.name.clone(),
                                details: join_error.to_string(),
                            });
                        }
                    }
                }
                _ = ctx.cancelled(), if !canceled => {
                    canceled = true;
                    debug!(parent: &self.base.logger, "step {} got canceled", self.base.info.name);
                }
            }
        }
        canceled = canceled || ctx.is_cancelled();
        self.base.steps = slots.into_iter().flatten().collect();

        let aggregated = self.base.error_combiner.combine(errors);

        if canceled {
            self.base.set_state(State::RollingBack);
            let mut errs: Vec<StepError> = aggregated.into_iter().collect();
            errs.push(cancel_error(&self.base.info.name));
            if let Err(e) = self.rollback(ctx.clone(), Arc::clone(&bus)).await {
                errs.push(e);
            }
            let error = self
                .base
                .error_combiner
                .combine(errs)
                .unwrap_or_else(|| cancel_error(&self.base.info.name));
            self.base.fail(&ctx, State::Canceled, &error);
            return Err(error);
        }

        if let Some(error) = aggregated {
            self.base.fail(&ctx, State::Failed, &error);
            return Err(error);
        }

        let combined = if received_context {
            self.base
                .context_combiner
                .combine(&contexts)
                .unwrap_or_else(|| ctx.clone())
        } else {
            ctx
        };
        self.base.succeed(&combined);
        Ok(combined)
    }

    async fn rollback(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
        self.base.compensate(&ctx)?;
        Ok(ctx)
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
        StepKind::Parallel
    }
}

fn cancel_error(name: &StepName) -> StepError {
    StepError::Canceled {
        step_name: name.clone(),
    }
}
