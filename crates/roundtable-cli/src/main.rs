//! CLI binary for validating workflow definitions and replaying scripted
//! sessions against in-memory collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use roundtable_engine::{
    ComputationRegistry, EngineEvent, EventEmitter, InMemoryDocumentStore, ResolutionCache,
    RuntimeOrchestrator, ScriptedService, StaticConfigSource, VariableResolver,
};
use roundtable_types::{NextTarget, TurnEvent, WorkflowDefinition};

#[derive(Parser)]
#[command(name = "roundtable", version, about = "Context-variable and handoff-routing engine for multi-agent workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition file
    Validate {
        /// Path to the workflow .json file
        workflow: PathBuf,
    },

    /// Show information about a workflow definition
    Info {
        /// Path to the workflow .json file
        workflow: PathBuf,
    },

    /// Replay a scripted event sequence against a workflow
    Run {
        /// Path to the workflow .json file
        workflow: PathBuf,

        /// Path to a JSON array of turn events to feed in order
        #[arg(short, long)]
        script: PathBuf,

        /// Config values as KEY=VALUE, consulted by `config` variables
        #[arg(short, long)]
        config: Vec<String>,

        /// Path to a JSON object of collection -> records to seed the
        /// in-memory document store
        #[arg(long)]
        seed: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Validate { workflow } => {
            cmd_validate(&workflow)?;
        }
        Commands::Info { workflow } => {
            cmd_info(&workflow)?;
        }
        Commands::Run {
            workflow,
            script,
            config,
            seed,
        } => {
            cmd_run(&workflow, &script, &config, seed.as_deref()).await?;
        }
    }

    Ok(())
}

fn load_workflow(path: &std::path::Path) -> anyhow::Result<WorkflowDefinition> {
    Ok(WorkflowDefinition::from_file(path)?)
}

fn cmd_validate(path: &std::path::Path) -> anyhow::Result<()> {
    let workflow = load_workflow(path)?;
    let diagnostics = roundtable_engine::validate(&workflow);

    if diagnostics.is_empty() {
        println!("Workflow is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            roundtable_engine::Severity::Error => {
                has_error = true;
                "ERROR"
            }
            roundtable_engine::Severity::Warning => "WARN",
            roundtable_engine::Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &std::path::Path) -> anyhow::Result<()> {
    let workflow = load_workflow(path)?;

    println!("Workflow: {}", workflow.name);
    println!("Participants: {}", workflow.participants.join(", "));
    println!("Variables: {}", workflow.variables.len());
    println!("Handoff rules: {}", workflow.handoffs.len());

    println!("\nVariables:");
    for def in &workflow.variables {
        println!(
            "  {} [{:?}] kind={}",
            def.name,
            def.value_type,
            def.source.kind()
        );
    }

    println!("\nHandoffs:");
    for rule in &workflow.handoffs {
        match &rule.condition {
            Some(cond) => println!("  {} -> {} when {}", rule.source, rule.target, cond),
            None => println!("  {} -> {} (fallback)", rule.source, rule.target),
        }
    }

    Ok(())
}

fn parse_config_pairs(pairs: &[String]) -> anyhow::Result<StaticConfigSource> {
    let mut source = StaticConfigSource::default();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("config value '{pair}' is not KEY=VALUE"))?;
        source = source.with(key, value);
    }
    Ok(source)
}

async fn cmd_run(
    workflow_path: &std::path::Path,
    script_path: &std::path::Path,
    config: &[String],
    seed: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let workflow = load_workflow(workflow_path)?;
    let script = std::fs::read_to_string(script_path)?;
    let events: Vec<TurnEvent> = serde_json::from_str(&script)?;

    let documents = Arc::new(InMemoryDocumentStore::new());
    if let Some(seed_path) = seed {
        let data = std::fs::read_to_string(seed_path)?;
        let collections: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&data)?;
        for (collection, records) in collections {
            let records = records
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("seed collection '{collection}' is not an array"))?;
            for record in records {
                documents.seed(&collection, record.clone());
            }
        }
    }

    let resolver = VariableResolver::new(
        Arc::new(parse_config_pairs(config)?),
        documents.clone(),
        Arc::new(ScriptedService::new()),
        ComputationRegistry::new(),
        Arc::new(ResolutionCache::new()),
    );
    let emitter = EventEmitter::default();
    let mut event_rx = emitter.subscribe();
    let mut orchestrator = RuntimeOrchestrator::new(workflow, resolver, documents, emitter)?;

    println!("Session: {}", orchestrator.session_id());
    orchestrator.start().await?;

    for (index, event) in events.iter().enumerate() {
        let result = orchestrator.process_turn(event).await?;
        println!("Turn {}: next = {}", index + 1, result.next);
        for error in &result.errors {
            println!("  degraded: {error}");
        }
        if result.next == NextTarget::Terminate {
            break;
        }
    }

    let flushed = orchestrator.end_session().await?;
    println!("\nSession ended; {flushed} deferred write(s) flushed");

    // Drain the event stream for a replay transcript
    println!("\nEvents:");
    while let Ok(event) = event_rx.try_recv() {
        match event {
            EngineEvent::TriggerFired { variable, to } => {
                println!("  trigger: {variable} -> {to}")
            }
            EngineEvent::HandoffSelected { from, to, .. } => {
                println!("  handoff: {from} -> {to}")
            }
            EngineEvent::ResolutionFailed { variable, error, .. } => {
                println!("  degraded: {variable}: {error}")
            }
            _ => {}
        }
    }

    let snapshot = orchestrator.session().snapshot().await;
    println!("\nFinal variables:");
    let mut names: Vec<_> = snapshot.keys().collect();
    names.sort();
    for name in names {
        println!("  {} = {}", name, snapshot[name]);
    }

    Ok(())
}
