//! # Kumitate (組立)
//!
//! A composable task-execution engine for Rust.
//!
//! The name "Kumitate" (組立) means "assembly" in Japanese: a [`Task`]
//! assembles a tree of [`Step`]s that run sequentially or in parallel, and
//! takes the tree apart again through compensating rollbacks when part of
//! it fails or is cancelled.
//!
//! ## Features
//!
//! - **Composition**: [`SequentialStep`] threads a context through its
//!   children, [`ParallelStep`] fans the same context out and fans results in
//! - **Compensation**: completed steps are rolled back in reverse order on
//!   failure; cancellation always wins over plain failure
//! - **Pluggable aggregation**: [`ContextCombiner`] and [`ErrorCombiner`]
//!   decide how child results become one outcome
//! - **Cancellation**: [`Context::with_cancel`] derives contexts whose
//!   cancellation reaches every step in the tree
//! - **Structured logging**: every step logs through a `tracing` span handed
//!   down from its task
//!
//! ## Quick Start
//!
//! ```rust
//! use kumitate::prelude::*;
//! use async_trait::async_trait;
//!
//! #[derive(Debug)]
//! struct CreateVolume {
//!     info: StepInfo,
//! }
//!
//! #[async_trait]
//! impl Step for CreateVolume {
//!     async fn run(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
//!         self.info.state = State::Completed;
//!         Ok(ctx.with_value("volume", "vol-1".to_string()))
//!     }
//!
//!     async fn rollback(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
//!         Ok(ctx)
//!     }
//!
//!     fn info(&self) -> &StepInfo {
//!         &self.info
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let root = SequentialStep::new(
//!     StepInfo::new("provision"),
//!     StepOpts {
//!         context_combiner: Some(ContextCombiner::last()),
//!         ..StepOpts::default()
//!     },
//!     vec![Box::new(CreateVolume { info: StepInfo::new("create-volume") })],
//! );
//!
//! let mut task = Task::new(TaskOpts::default(), Box::new(root));
//! task.run().await.expect("task failed");
//!
//! assert_eq!(task.check_status(), State::Completed);
//! assert_eq!(task.context().value::<String>("volume"), Some(&"vol-1".to_string()));
//! # }
//! ```
//!
//! ## Cancellation
//!
//! ```rust
//! use kumitate::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (ctx, cancel) = Context::background().with_cancel();
//! cancel.cancel();
//!
//! let mut fanout = ParallelStep::new(StepInfo::new("fanout"), StepOpts::default(), Vec::new());
//! let error = fanout
//!     .run(ctx, InMemoryEventBus::shared())
//!     .await
//!     .expect_err("cancelled run must fail");
//!
//! assert!(error.is_canceled());
//! assert_eq!(fanout.info().state, State::Canceled);
//! # }
//! ```

mod combine;
mod context;
mod error;
mod event;
mod generic;
mod parallel;
mod sequential;
mod state;
mod step;
mod task;

pub mod prelude;

pub use combine::{resolve_logger, ContextCombiner, ErrorCombiner, Logger};
pub use context::{CancelHandle, Context, ContextKey};
pub use error::{BusError, StepError};
pub use event::{Event, EventBus, EventHandler, InMemoryEventBus, SharedEventBus};
pub use generic::GenericStep;
pub use parallel::ParallelStep;
pub use sequential::SequentialStep;
pub use state::State;
pub use step::{
    active_steps, filter, find_steps, FailFn, RollbackFn, Step, StepInfo, StepKind, StepName,
    StepOpts, SuccessFn,
};
pub use task::{
    Task, TaskFailFn, TaskId, TaskOpts, TaskRollbackFn, TaskSnapshot, TaskSuccessFn, TaskType,
};
