//! Cluster provisioning task.
//!
//! This example demonstrates:
//! 1. Composing leaf steps into sequential and parallel groups
//! 2. Rolling back completed work when a later step fails
//! 3. Cancelling a running task from the outside
//!
//! Run with `cargo run --example provision -- fail` to see the rollback path,
//! or with `cancel` to cancel while the machines are being created.

use async_trait::async_trait;
use kumitate::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const MACHINES: [&str; 3] = ["vm-1", "vm-2", "vm-3"];

// Leaf step simulating a call to an infrastructure API
#[derive(Debug)]
struct ProvisionStep {
    info: StepInfo,
    latency: Duration,
    fails: bool,
}

impl ProvisionStep {
    fn boxed(name: &str, latency_ms: u64, fails: bool) -> Box<dyn Step> {
        Box::new(Self {
            info: StepInfo::new(name),
            latency: Duration::from_millis(latency_ms),
            fails,
        })
    }
}

#[async_trait]
impl Step for ProvisionStep {
    async fn run(&mut self, ctx: Context, bus: SharedEventBus) -> Result<Context, StepError> {
        self.info.state = State::Processing;
        println!("{}: working...", self.info.name);

        tokio::select! {
            _ = tokio::time::sleep(self.latency) => {}
            _ = ctx.cancelled() => {
                println!("{}: interrupted", self.info.name);
                self.info.state = State::Canceled;
                return Err(StepError::Canceled { step_name: self.info.name.clone() });
            }
        }

        if self.fails {
            self.info.state = State::Failed;
            return Err(StepError::Failed {
                step_name: self.info.name.clone(),
                details: "quota exceeded".to_string(),
            });
        }

        bus.publish(Event::new("resource.created").with("resource", self.info.name.as_str()))?;
        self.info.state = State::Completed;
        Ok(ctx.with_value(self.info.name.as_str(), format!("{}-id", self.info.name)))
    }

    async fn rollback(&mut self, ctx: Context, _bus: SharedEventBus) -> Result<Context, StepError> {
        println!("{}: releasing", self.info.name);
        Ok(ctx)
    }

    fn info(&self) -> &StepInfo {
        &self.info
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mode = std::env::args().nth(1).unwrap_or_default();

    // Keep every machine id, not just the first context
    let merge_ids = ContextCombiner::new(|contexts| {
        let mut merged = contexts.first()?.clone();
        for ctx in contexts.iter().skip(1) {
            for key in MACHINES {
                if let Some(id) = ctx.value::<String>(key) {
                    merged = merged.with_value(key, id.clone());
                }
            }
        }
        Some(merged)
    });

    let mut machines = ParallelStep::new(
        StepInfo::new("create-machines"),
        StepOpts {
            context_combiner: Some(merge_ids),
            ..StepOpts::default()
        },
        vec![
            ProvisionStep::boxed("vm-1", 150, false),
            ProvisionStep::boxed("vm-2", 100, false),
            ProvisionStep::boxed("vm-3", 200, false),
        ],
    );
    machines.base_mut().set_rollback_fn(|_| {
        println!("create-machines: deleting all machines");
        Ok(())
    });

    let mut root = SequentialStep::new(
        StepInfo::new("provision-cluster"),
        StepOpts {
            context_combiner: Some(ContextCombiner::last()),
            ..StepOpts::default()
        },
        vec![
            ProvisionStep::boxed("network", 50, false),
            Box::new(machines),
            ProvisionStep::boxed("dns", 50, mode == "fail"),
        ],
    );
    root.base_mut().set_success_fn(|_, info| println!("{} finished", info.name));

    let (ctx, cancel) = Context::background()
        .with_value("region", "eu-west")
        .with_cancel();

    let mut task = Task::new(
        TaskOpts {
            task_type: TaskType::new("provision"),
            name: "cluster-7".to_string(),
            ctx,
            event_handler: Some(EventHandler::new(|event| {
                println!("event: {} {:?}", event.topic, event.payload);
                Ok(())
            })),
            fail_fn: Some(Arc::new(|task: &Task, error: &StepError| {
                println!("task {} failed: {}", task.name(), error);
            })),
            ..TaskOpts::default()
        },
        Box::new(root),
    );

    if mode == "cancel" {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            println!("cancelling...");
            cancel.cancel();
        });
    }

    match task.run().await {
        Ok(()) => {
            let ctx = task.context();
            for key in ["network"].into_iter().chain(MACHINES).chain(["dns"]) {
                if let Some(id) = ctx.value::<String>(key) {
                    println!("{key} = {id}");
                }
            }
        }
        Err(error) => {
            for cause in error.flatten() {
                println!("cause: {cause}");
            }
        }
    }
    println!("task {} ended {}", task.id(), task.check_status());
    println!("{}", serde_json::to_string_pretty(&task)?);

    Ok(())
}
