mod wiring;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meridian_coordination::{
    ExecutionStrategy, RequestClassifier, RequestContext, SynthesisInput, SynthesisOptions,
    SynthesisStrategy, TaskOptions,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; defaults plus MERIDIAN_* variables when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// YAML rule pack appended to the default routing rules
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show intent, complexity and urgency of a request
    Classify {
        text: String,
        /// Request context as a JSON object
        #[arg(long)]
        context: Option<String>,
    },
    /// Show where a request would be routed
    Route {
        text: String,
        #[arg(long)]
        context: Option<String>,
    },
    /// Execute a request and print the synthesized answer
    Run {
        text: String,
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<ExecutionStrategy>,
        /// Subsystem to call; repeat for several. Routed when omitted.
        #[arg(long = "target")]
        targets: Vec<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        context: Option<String>,
    },
    /// Run a named workflow, or list them
    Workflow {
        name: Option<String>,
        text: Option<String>,
        /// YAML workflow catalog to register first
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        list: bool,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Merge results from a JSON array file
    Synthesize {
        input: PathBuf,
        #[arg(long, value_parser = parse_synthesis_strategy)]
        strategy: Option<SynthesisStrategy>,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        max_length: Option<usize>,
    },
}

fn parse_strategy(s: &str) -> Result<ExecutionStrategy, String> {
    s.parse().map_err(|e: meridian_coordination::OrchestrationError| e.to_string())
}

fn parse_synthesis_strategy(s: &str) -> Result<SynthesisStrategy, String> {
    s.parse()
        .map_err(|e: meridian_coordination::synthesizer::SynthesisError| e.to_string())
}

fn parse_context(raw: Option<&str>) -> Result<RequestContext> {
    match raw {
        None => Ok(RequestContext::new()),
        Some(raw) => serde_json::from_str(raw).context("--context must be a JSON object"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json);

    let config = wiring::load_config(args.config.as_deref())?;

    match args.command {
        Command::Classify { text, context } => {
            let context = parse_context(context.as_deref())?;
            print_json(&RequestClassifier::new().classify(&text, &context))?;
        }
        Command::Route { text, context } => {
            let context = parse_context(context.as_deref())?;
            let service = wiring::build_service(config, args.rules.as_deref())?;
            print_json(&service.route(&text, &context))?;
        }
        Command::Run {
            text,
            strategy,
            targets,
            timeout_ms,
            context,
        } => {
            let mut options = TaskOptions::default()
                .with_targets(targets)
                .with_context(parse_context(context.as_deref())?);
            options.strategy = strategy;
            if let Some(ms) = timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }

            let service = wiring::build_service(config, args.rules.as_deref())?;
            service.initialize();
            let result = service.execute_task(&text, options).await;
            service.shutdown().await;
            let response = result.context("task failed")?;
            info!(
                task_id = %response.task.task_id,
                confidence = response.synthesis.confidence,
                "Task finished"
            );
            print_json(&response)?;
        }
        Command::Workflow {
            name,
            text,
            catalog,
            list,
            timeout_ms,
        } => {
            let service = wiring::build_service(config, args.rules.as_deref())?;
            if let Some(path) = &catalog {
                let count = wiring::load_workflows(&service, path).await?;
                info!(workflows = count, "Workflow catalog loaded");
            }
            if list {
                print_json(&service.orchestrator().list_workflows().await)?;
                return Ok(());
            }
            let (Some(name), Some(text)) = (name, text) else {
                bail!("workflow needs a NAME and TEXT, or --list");
            };

            let mut options = TaskOptions::default();
            if let Some(ms) = timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }
            service.initialize();
            let result = service.execute_workflow(&name, &text, options).await;
            service.shutdown().await;
            print_json(&result.with_context(|| format!("workflow '{}' failed", name))?)?;
        }
        Command::Synthesize {
            input,
            strategy,
            query,
            max_length,
        } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let values: Vec<Value> =
                serde_json::from_str(&raw).context("input must be a JSON array")?;
            let inputs: Vec<SynthesisInput> = values.into_iter().map(SynthesisInput::from).collect();

            let options = SynthesisOptions {
                strategy,
                query,
                max_length,
                ..Default::default()
            };
            let service = wiring::build_service(config, None)?;
            print_json(&service.synthesize(&inputs, &options))?;
        }
    }

    Ok(())
}
