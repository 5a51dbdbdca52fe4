//! `loom` - run the engine in one process on the in-memory Store / Messenger.

mod cli;
mod logging;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::info;

use loom_core::app::GraphFilter;
use loom_core::domain::{GraphDefinition, GraphStatus, TaskDefinition};
use loom_core::impls::{InMemoryMessenger, InMemoryStore};
use loom_core::ports::Messenger;
use loom_core::{EngineBuilder, EngineConfig, Roles};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("loom error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(domain) = &args.domain {
        config.domain = domain.clone();
    }
    let (scheduler, runner) = args.roles();

    let store = Arc::new(InMemoryStore::new());
    let messenger = Arc::new(InMemoryMessenger::new());
    let mut builder = EngineBuilder::new(store, messenger.clone())
        .config(config.clone())
        .roles(Roles { scheduler, runner });
    if let Some(path) = &args.definitions {
        let (tasks, graphs) = load_definitions(path)?;
        builder = tasks.into_iter().fold(builder, |b, t| b.define_task(t));
        builder = graphs.into_iter().fold(builder, |b, g| b.define_graph(g));
    }
    if let Some(name) = &args.run {
        builder = builder.expect_graphs(&[name.as_str()]);
    }
    let mut engine = builder.build()?;

    // subscribe before anything can finish
    let mut finished = messenger.subscribe_graph_finished(&config.domain).await?;
    engine.start().await?;

    let Some(name) = &args.run else {
        info!(domain = %config.domain, scheduler, runner, "waiting for ctrl-c");
        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        engine.stop();
        return Ok(());
    };

    let options = args
        .options
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--options must be valid JSON")?;
    let active = engine
        .service()
        .run_task_graph(name, options, args.target.clone())
        .await?;

    let status = loop {
        tokio::select! {
            event = finished.recv() => match event {
                Some(event) if event.graph_id == active.graph_id => break event.status,
                Some(_) => continue,
                None => bail!("graph finished subscription closed"),
            },
            _ = tokio::signal::ctrl_c() => {
                engine
                    .service()
                    .cancel_task_graph(&GraphFilter::by_id(active.graph_id))
                    .await?;
                break GraphStatus::Cancelled;
            }
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "graphId": active.graph_id,
            "name": active.name,
            "status": status,
            "engine": engine.status(),
        }))?
    );
    engine.stop();

    if status != GraphStatus::Succeeded {
        bail!("graph {} finished with status {status}", active.graph_id);
    }
    Ok(())
}

fn load_definitions(path: &Path) -> Result<(Vec<TaskDefinition>, Vec<GraphDefinition>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read definitions from {}", path.display()))?;
    let doc: Value = serde_json::from_str(&raw).context("definitions file is not valid JSON")?;

    let section = |key: &str| doc.get(key).cloned().unwrap_or(Value::Array(Vec::new()));
    let tasks = serde_json::from_value(section("tasks")).context("invalid task definitions")?;
    let graphs = serde_json::from_value(section("graphs")).context("invalid graph definitions")?;
    Ok((tasks, graphs))
}
