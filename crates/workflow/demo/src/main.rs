//! Workflow demo - runs sample workflows on the in-memory runtime
//!
//! Scenarios:
//! - `orders`: sequential, parallel and conditional steps
//! - `approval`: a nested workflow that suspends until resumed
//! - `batch`: foreach with bounded concurrency, a timer and retries,
//!   observed through the run stream

use anyhow::Context;
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workflow_engine::{EngineConfig, ResumeRequest, RunOutput, WorkflowRuntime};
use workflow_storage::QueryWindow;

mod workflows;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    All,
    Orders,
    Approval,
    Batch,
}

/// Workflow demo CLI
#[derive(Parser)]
#[command(name = "workflow-demo")]
#[command(about = "Run sample workflows on the in-memory workflow runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WORKFLOW_CONFIG")]
    config: Option<String>,

    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Log level
    #[arg(long, env = "WORKFLOW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "WORKFLOW_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config =
        EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Override with CLI args
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.logging.json |= cli.json;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let runtime = WorkflowRuntime::in_memory(config);
    runtime.register(workflows::order_intake()?)?;
    runtime.register(workflows::expense_approval()?)?;
    runtime.register(workflows::batch_resize()?)?;
    runtime.start().await?;
    tracing::info!(
        workflows = ?runtime.registry().list(),
        workers = runtime.config().execution.workers,
        "Workflow runtime ready"
    );

    let scenario = cli.scenario;
    if matches!(scenario, Scenario::All | Scenario::Orders) {
        orders(&runtime).await?;
    }
    if matches!(scenario, Scenario::All | Scenario::Approval) {
        approval(&runtime).await?;
    }
    if matches!(scenario, Scenario::All | Scenario::Batch) {
        batch(&runtime).await?;
    }

    runtime.shutdown().await?;
    Ok(())
}

async fn orders(runtime: &WorkflowRuntime) -> anyhow::Result<()> {
    for order in [json!({ "id": "A-1", "amount": 80.0 }), json!({ "id": "A-2", "amount": 900.0 })] {
        let run = runtime.create_run("order-intake")?;
        let output = run.start(order).await?;
        report("order-intake", &output)?;
    }

    let rejected = runtime.create_run("order-intake")?;
    report("order-intake", &rejected.start(json!({ "amount": 0 })).await?)?;

    let runs = runtime
        .list_runs("order-intake", QueryWindow::new(10, 0))
        .await?;
    for summary in runs {
        println!("  {} {}", summary.run_id, summary.status);
    }
    Ok(())
}

async fn approval(runtime: &WorkflowRuntime) -> anyhow::Result<()> {
    let run = runtime.create_run("expense-approval")?;
    let suspended = run
        .start(json!({ "employee": "kim", "amount": 42.0 }))
        .await?;
    report("expense-approval", &suspended)?;

    let chain = suspended
        .suspended
        .first()
        .cloned()
        .context("expected a suspended step")?;
    let resumed = run
        .resume(ResumeRequest::chain(
            chain,
            json!({ "approved": true, "reviewer": "lee" }),
        ))
        .await?;
    report("expense-approval", &resumed)
}

async fn batch(runtime: &WorkflowRuntime) -> anyhow::Result<()> {
    let run = runtime.create_run("batch-resize")?;
    let mut stream = run
        .stream(json!(["cat.png", "dog.png", "fox.png"]))
        .await?;
    while let Some(chunk) = stream.next().await {
        println!("  chunk {}", serde_json::to_string(&chunk)?);
    }
    let output = stream.result().await?;
    report("batch-resize", &output)
}

fn report(workflow: &str, output: &RunOutput) -> anyhow::Result<()> {
    println!(
        "{} -> {}\n{}",
        workflow,
        output.status,
        serde_json::to_string_pretty(&json!({
            "result": output.result,
            "error": output.error,
            "suspended": output.suspended,
        }))?
    );
    Ok(())
}
