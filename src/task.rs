//! Top-level driver that runs one root step to a terminal outcome.

use crate::combine::{resolve_logger, ErrorCombiner, Logger};
use crate::context::Context;
use crate::error::StepError;
use crate::event::{EventHandler, InMemoryEventBus, SharedEventBus};
use crate::state::State;
use crate::step::{Step, StepInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Unique identifier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Free-form classification of a task, e.g. `"provision-cluster"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    /// Creates a new TaskType.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self(task_type.into())
    }

    /// Returns the type as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if no type was given.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Serializable record of a task: its identity and the root step's info.
///
/// Empty type and name are omitted from the serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub created: DateTime<Utc>,
    pub id: TaskId,
    #[serde(rename = "type", default, skip_serializing_if = "TaskType::is_empty")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "taskstep", default, skip_serializing_if = "Option::is_none")]
    pub task_step: Option<StepInfo>,
}

/// Invoked once after a task run succeeds.
pub type TaskSuccessFn = Arc<dyn Fn(&Task) + Send + Sync>;

/// Invoked once after a task run fails.
pub type TaskFailFn = Arc<dyn Fn(&Task, &StepError) + Send + Sync>;

/// Task-level compensation, run when the task's context was cancelled.
pub type TaskRollbackFn = Arc<dyn Fn(&Task) -> Result<(), StepError> + Send + Sync>;

/// Construction-time configuration for a [`Task`].
///
/// Every field except `ctx` falls back to a default when left unset: no
/// callbacks, the no-op event handler, the joining error combiner, the span
/// current at construction and a fresh [`InMemoryEventBus`].
///
/// # Examples
///
/// ```
/// use kumitate::{Context, TaskOpts, TaskType};
///
/// let opts = TaskOpts {
///     task_type: TaskType::new("provision"),
///     name: "provision-cluster-7".to_string(),
///     ctx: Context::new().with_value("region", "eu-west"),
///     ..TaskOpts::default()
/// };
/// assert!(opts.success_fn.is_none());
/// ```
#[derive(Clone, Default)]
pub struct TaskOpts {
    /// Classification of the task.
    pub task_type: TaskType,
    /// Human readable name.
    pub name: String,
    /// The context the task derives its cancellable run context from.
    pub ctx: Context,
    /// Called once after a successful run.
    pub success_fn: Option<TaskSuccessFn>,
    /// Called once after a failed run.
    pub fail_fn: Option<TaskFailFn>,
    /// Subscribed to the task's event bus at construction.
    pub event_handler: Option<EventHandler>,
    /// Combines the root step's error with the task rollback outcome.
    pub error_combiner: Option<ErrorCombiner>,
    /// Logger handed to the root step and all its descendants.
    pub logger: Option<Logger>,
    /// Bus owned by the task for one run.
    pub event_bus: Option<SharedEventBus>,
    /// Task-level compensation hook.
    pub rollback_fn: Option<TaskRollbackFn>,
}

impl fmt::Debug for TaskOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOpts")
            .field("task_type", &self.task_type)
            .field("name", &self.name)
            .field("ctx", &self.ctx)
            .field("event_bus", &self.event_bus)
            .finish()
    }
}

/// Drives one run of a root step and reacts to its outcome.
///
/// The task has no state of its own: [`Task::check_status`] mirrors the root
/// step. Whatever the outcome, exactly one of the success or fail callbacks
/// fires and the event bus is closed before [`Task::run`] returns.
///
/// # Examples
///
/// ```
/// use kumitate::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() {
/// let root = SequentialStep::new(
///     StepInfo::new("root"),
///     StepOpts::default(),
///     vec![Box::new(GenericStep::new(StepInfo::new("marker"), None, Vec::new()))],
/// );
/// let mut task = Task::new(TaskOpts::default(), Box::new(root));
/// assert_eq!(task.check_status(), State::Created);
///
/// task.run().await.expect("task failed");
/// assert_eq!(task.check_status(), State::Completed);
/// # }
/// ```
pub struct Task {
    id: TaskId,
    task_type: TaskType,
    name: String,
    created: DateTime<Utc>,
    root_step: Box<dyn Step>,

    ctx: Context,
    logger: Logger,
    event_bus: SharedEventBus,
    error_combiner: ErrorCombiner,
    success_fn: Option<TaskSuccessFn>,
    fail_fn: Option<TaskFailFn>,
    rollback_fn: Option<TaskRollbackFn>,
    bus_closed: bool,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("name", &self.name)
            .field("created", &self.created)
            .field("root_step", &self.root_step)
            .finish()
    }
}

impl Serialize for Task {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl Task {
    /// Creates a task owning `root_step` and a fresh event bus.
    pub fn new(opts: TaskOpts, mut root_step: Box<dyn Step>) -> Self {
        let logger = resolve_logger(opts.logger);
        root_step.set_logger(logger.clone());

        let event_bus = opts.event_bus.unwrap_or_else(InMemoryEventBus::shared);
        event_bus.subscribe(opts.event_handler.unwrap_or_default());

        Self {
            id: TaskId::generate(),
            task_type: opts.task_type,
            name: opts.name,
            created: Utc::now(),
            root_step,
            ctx: opts.ctx,
            logger,
            event_bus,
            error_combiner: opts.error_combiner.unwrap_or_default(),
            success_fn: opts.success_fn,
            fail_fn: opts.fail_fn,
            rollback_fn: opts.rollback_fn,
            bus_closed: false,
        }
    }

    /// Runs the root step once on a cancellable derivation of the task's context.
    ///
    /// If the context is found cancelled when the root step returns, the
    /// task-level [`Task::rollback`] runs and its outcome is combined with the
    /// root step's error. Otherwise the root step's returned context becomes
    /// the task's context. The run context is cancelled before this returns.
    pub async fn run(&mut self) -> Result<(), StepError> {
        let (ctx, cancel) = self.ctx.with_cancel();

        debug!(parent: &self.logger, "task {} ({}) started", self.name, self.id);
        let outcome = self
            .root_step
            .run(ctx.clone(), Arc::clone(&self.event_bus))
            .await;

        let result = if ctx.is_cancelled() {
            debug!(parent: &self.logger, "task {} got canceled", self.name);
            let errors: Vec<StepError> = [outcome.err(), self.rollback().err()]
                .into_iter()
                .flatten()
                .collect();
            self.error_combiner.combine(errors)
        } else {
            match outcome {
                Ok(next) => {
                    self.ctx = next;
                    None
                }
                Err(e) => Some(e),
            }
        };
        // Release anything still waiting on the run context.
        cancel.cancel();

        match result {
            None => {
                debug!(parent: &self.logger, "task {} succeeded", self.name);
                self.success();
                Ok(())
            }
            Some(error) => {
                debug!(parent: &self.logger, "task {} failed, {}", self.name, error);
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Task-level compensation. The root step has already compensated for
    /// itself by the time this runs; without a configured hook it does nothing.
    pub fn rollback(&self) -> Result<(), StepError> {
        match &self.rollback_fn {
            Some(f) => f(self),
            None => Ok(()),
        }
    }

    /// Returns the root step's state, or [`State::Created`] if it never ran.
    pub fn check_status(&self) -> State {
        match self.root_step.info().state {
            State::None => State::Created,
            state => state,
        }
    }

    /// Returns the task's identifier.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Returns the task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the task's type.
    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Returns when the task was constructed.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Returns the root step.
    pub fn root_step(&self) -> &dyn Step {
        self.root_step.as_ref()
    }

    /// Returns the task's current context: the one it was built with, or after
    /// a successful run the context returned by the root step.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Returns the task's event bus.
    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    /// Captures the task's identity and the root step's current info.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            created: self.created,
            id: self.id,
            task_type: self.task_type.clone(),
            name: self.name.clone(),
            task_step: Some(self.root_step.info().clone()),
        }
    }

    fn success(&mut self) {
        if let Some(f) = &self.success_fn {
            f(self);
        }
        self.close_bus();
    }

    fn fail(&mut self, error: &StepError) {
        if let Some(f) = &self.fail_fn {
            f(self, error);
        }
        self.close_bus();
    }

    fn close_bus(&mut self) {
        if !self.bus_closed {
            self.bus_closed = true;
            self.event_bus.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic::GenericStep;

    #[test]
    fn test_task_identity() {
        let task = Task::new(
            TaskOpts {
                task_type: TaskType::new("provision"),
                name: "cluster".to_string(),
                ..TaskOpts::default()
            },
            Box::new(GenericStep::new(StepInfo::new("root"), None, Vec::new())),
        );
        assert_eq!(task.name(), "cluster");
        assert_eq!(task.task_type().as_str(), "provision");
        assert_eq!(task.id().as_uuid().get_version_num(), 4);
        assert!(task.created() <= Utc::now());
        assert_eq!(task.root_step().info().name, "root");
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn test_check_status_before_run() {
        let task = Task::new(
            TaskOpts::default(),
            Box::new(GenericStep::new(StepInfo::new("root"), None, Vec::new())),
        );
        assert_eq!(task.check_status(), State::Created);
    }

    #[test]
    fn test_default_rollback_is_noop() {
        let task = Task::new(
            TaskOpts::default(),
            Box::new(GenericStep::new(StepInfo::new("root"), None, Vec::new())),
        );
        assert_eq!(task.rollback(), Ok(()));
    }

    #[derive(Debug)]
    struct Capture {
        info: StepInfo,
        seen: Arc<std::sync::Mutex<Option<Context>>>,
        fails: bool,
    }

    #[async_trait::async_trait]
    impl Step for Capture {
        async fn run(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
            if let Ok(mut seen) = self.seen.lock() {
                *seen = Some(ctx.clone());
            }
            if self.fails {
                self.info.state = State::Failed;
                return Err(StepError::Failed {
                    step_name: self.info.name.clone(),
                    details: "capture failed".to_string(),
                });
            }
            self.info.state = State::Completed;
            Ok(ctx)
        }

        async fn rollback(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
            Ok(ctx)
        }

        fn info(&self) -> &StepInfo {
            &self.info
        }
    }

    #[tokio::test]
    async fn test_run_context_is_released_after_run() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let mut task = Task::new(
            TaskOpts::default(),
            Box::new(Capture {
                info: StepInfo::new("capture"),
                seen: Arc::clone(&seen),
                fails: false,
            }),
        );

        tokio_test::assert_ok!(task.run().await);

        let ctx = seen
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .unwrap_or_default();
        assert!(ctx.is_cancelled());
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(200), ctx.cancelled()).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_run_context_is_released_after_failure() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let (parent, parent_handle) = Context::background().with_cancel();
        let mut task = Task::new(
            TaskOpts {
                ctx: parent,
                ..TaskOpts::default()
            },
            Box::new(Capture {
                info: StepInfo::new("capture"),
                seen: Arc::clone(&seen),
                fails: true,
            }),
        );

        tokio_test::assert_err!(task.run().await);

        let ctx = seen
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .unwrap_or_default();
        assert!(ctx.is_cancelled());
        assert!(!parent_handle.is_cancelled());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let task = Task::new(
            TaskOpts {
                task_type: TaskType::new("provision"),
                name: "cluster".to_string(),
                ..TaskOpts::default()
            },
            Box::new(GenericStep::new(StepInfo::new("root"), None, Vec::new())),
        );

        let json = serde_json::to_value(&task).unwrap_or_default();
        assert_eq!(json["id"], task.id().to_string());
        assert_eq!(json["type"], "provision");
        assert_eq!(json["name"], "cluster");
        assert_eq!(json["taskstep"]["name"], "root");
        assert_eq!(json["taskstep"]["state"], "none");

        let back: Result<TaskSnapshot, _> = serde_json::from_value(json);
        assert_eq!(back.ok(), Some(task.snapshot()));
    }

    #[test]
    fn test_snapshot_omits_empty_fields() {
        let task = Task::new(
            TaskOpts::default(),
            Box::new(GenericStep::new(StepInfo::new("root"), None, Vec::new())),
        );
        let json = serde_json::to_value(task.snapshot()).unwrap_or_default();
        assert!(json.get("type").is_none());
        assert!(json.get("name").is_none());
        assert!(json.get("created").is_some());

        let minimal = serde_json::json!({
            "created": task.created(),
            "id": task.id(),
        });
        let back: Result<TaskSnapshot, _> = serde_json::from_value(minimal);
        assert_eq!(back.ok().and_then(|s| s.task_step), None);
    }
}
