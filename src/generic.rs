use crate::combine::{resolve_logger, ContextCombiner, ErrorCombiner, Logger};
use crate::context::Context;
use crate::error::StepError;
use crate::event::{EventHandler, SharedEventBus};
use crate::state::State;
use crate::step::{FailFn, RollbackFn, Step, StepInfo, StepKind, StepName, StepOpts, SuccessFn};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Base step implementing the [`Step`] contract with no-op `run` and `rollback`.
///
/// Used directly as a marker step, and embedded by every composite step for
/// its lifecycle state, aggregation policies, callbacks and logger.
/// [`GenericStep::set_state`] is the only way its state changes.
pub struct GenericStep {
    pub(crate) info: StepInfo,
    pub(crate) steps: Vec<Box<dyn Step>>,
    pub(crate) logger: Logger,
    pub(crate) context_combiner: ContextCombiner,
    pub(crate) error_combiner: ErrorCombiner,
    pub(crate) event_handler: EventHandler,
    success_fn: Option<SuccessFn>,
    fail_fn: Option<FailFn>,
    rollback_fn: Option<RollbackFn>,
    rolled_back: bool,
}

impl fmt::Debug for GenericStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericStep")
            .field("info", &self.info)
            .field("steps", &self.steps)
            .field("rolled_back", &self.rolled_back)
            .finish()
    }
}

impl GenericStep {
    /// Creates a generic step with default aggregation policies.
    pub fn new(info: StepInfo, logger: Option<Logger>, steps: Vec<Box<dyn Step>>) -> Self {
        Self::with_opts(
            info,
            StepOpts {
                logger,
                ..StepOpts::default()
            },
            steps,
        )
    }

    /// Creates a generic step, filling unset options with their defaults.
    pub fn with_opts(info: StepInfo, opts: StepOpts, steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            info,
            steps,
            logger: resolve_logger(opts.logger),
            context_combiner: opts.context_combiner.unwrap_or_default(),
            error_combiner: opts.error_combiner.unwrap_or_default(),
            event_handler: opts.event_handler.unwrap_or_default(),
            success_fn: None,
            fail_fn: None,
            rollback_fn: None,
            rolled_back: false,
        }
    }

    /// Returns the step's name.
    pub fn name(&self) -> &StepName {
        &self.info.name
    }

    /// Returns the step's current state.
    pub fn state(&self) -> State {
        self.info.state
    }

    /// Moves the step to `state`.
    ///
    /// Transitions the lifecycle graph does not allow are refused and logged;
    /// the return value tells whether the state changed.
    pub fn set_state(&mut self, state: State) -> bool {
        if !self.info.state.can_transition_to(state) {
            warn!(
                parent: &self.logger,
                "step {} refused transition {} -> {}", self.info.name, self.info.state, state
            );
            return false;
        }
        self.info.state = state;
        true
    }

    /// Sets the callback invoked after the step succeeds.
    pub fn set_success_fn<F>(&mut self, f: F)
    where
        F: Fn(&Context, &StepInfo) + Send + Sync + 'static,
    {
        self.success_fn = Some(Arc::new(f));
    }

    /// Sets the callback invoked after the step fails or is cancelled.
    pub fn set_fail_fn<F>(&mut self, f: F)
    where
        F: Fn(&Context, &StepInfo, &StepError) + Send + Sync + 'static,
    {
        self.fail_fn = Some(Arc::new(f));
    }

    /// Sets the step's own compensating action, run by composite rollback.
    pub fn set_rollback_fn<F>(&mut self, f: F)
    where
        F: Fn(&Context) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.rollback_fn = Some(Arc::new(f));
    }

    /// Replaces the context combiner.
    pub fn set_context_combiner(&mut self, combiner: ContextCombiner) {
        self.context_combiner = combiner;
    }

    /// Replaces the error combiner.
    pub fn set_error_combiner(&mut self, combiner: ErrorCombiner) {
        self.error_combiner = combiner;
    }

    /// Replaces the event handler subscribed at the start of `run`.
    pub fn set_event_handler(&mut self, handler: EventHandler) {
        self.event_handler = handler;
    }

    /// Returns the logger the step logs through.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Enters `Processing` and subscribes the event handler.
    ///
    /// Fails without side effects if the step has already been run.
    pub(crate) fn begin(&mut self, bus: &SharedEventBus) -> Result<(), StepError> {
        if self.info.state != State::None {
            return Err(StepError::AlreadyRun {
                step_name: self.info.name.clone(),
                state: self.info.state,
            });
        }
        self.set_state(State::Processing);
        bus.subscribe(self.event_handler.clone());
        debug!(parent: &self.logger, "step {} started", self.info.name);
        Ok(())
    }

    /// Marks the step completed and invokes the success callback.
    pub(crate) fn succeed(&mut self, ctx: &Context) {
        self.set_state(State::Completed);
        debug!(parent: &self.logger, "step {} completed", self.info.name);
        if let Some(f) = &self.success_fn {
            f(ctx, &self.info);
        }
    }

    /// Moves the step to a failure state and invokes the fail callback.
    pub(crate) fn fail(&mut self, ctx: &Context, terminal: State, error: &StepError) {
        self.set_state(terminal);
        debug!(
            parent: &self.logger,
            "step {} {}: {}", self.info.name, terminal, error
        );
        if let Some(f) = &self.fail_fn {
            f(ctx, &self.info, error);
        }
    }

    /// Runs the compensation hook, at most once per run.
    pub(crate) fn compensate(&mut self, ctx: &Context) -> Result<(), StepError> {
        if self.rolled_back {
            debug!(parent: &self.logger, "step {} already rolled back", self.info.name);
            return Ok(());
        }
        self.rolled_back = true;
        debug!(parent: &self.logger, "rolling back step {}", self.info.name);
        match &self.rollback_fn {
            Some(f) => f(ctx).map_err(|e| {
                warn!(parent: &self.logger, "rollback of step {} failed: {}", self.info.name, e);
                e
            }),
            None => Ok(()),
        }
    }

    /// Hands `logger` to this step and every descendant.
    pub(crate) fn cascade_logger(&mut self, logger: Logger) {
        for step in &mut self.steps {
            step.set_logger(logger.clone());
        }
        self.logger = logger;
    }
}

#[async_trait]
impl Step for GenericStep {
    async fn run(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
        Ok(ctx)
    }

    async fn rollback(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
        Ok(ctx)
    }

    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    fn set_logger(&mut self, logger: Logger) {
        self.cascade_logger(logger);
    }

    fn kind(&self) -> StepKind {
        StepKind::Generic
    }
}
