//! Commonly used types and traits

pub use crate::combine::{ContextCombiner, ErrorCombiner, Logger};
pub use crate::context::{CancelHandle, Context};
pub use crate::error::StepError;
pub use crate::event::{Event, EventBus, EventHandler, InMemoryEventBus, SharedEventBus};
pub use crate::generic::GenericStep;
pub use crate::parallel::ParallelStep;
pub use crate::sequential::SequentialStep;
pub use crate::state::State;
pub use crate::step::{Step, StepInfo, StepKind, StepName, StepOpts};
pub use crate::task::{Task, TaskOpts, TaskType};
