use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use deepdive_core::{
    ConfigLoader, EngineKind, EventCollector, ReportMode, SessionLogInput, SessionOptions,
    SessionRequest, TelemetryOptions, TraceCollector, clarifying_questions, init_telemetry,
    log_session_completion, remove_session_logs, run_research_session_with_options,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "deepdive",
    version,
    about = "Iterative web research with cited reports"
)]
struct Cli {
    /// Path to a TOML config (defaults to $DEEPDIVE_CONFIG, then ./deepdive.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a research session and print the report.
    Run(RunArgs),
    /// Ask follow-up questions that would sharpen a query.
    Clarify(ClarifyArgs),
    /// Delete the audit log lines recorded for a session.
    PurgeLogs(PurgeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Query to research.
    #[arg(long)]
    query: String,

    /// Search engine: searxng, firecrawl or browser.
    #[arg(long, default_value = "searxng")]
    engine: EngineKind,

    /// Planning rounds (overrides research.max_depth).
    #[arg(long)]
    max_depth: Option<u32>,

    /// Sub-queries per round (overrides research.max_breadth).
    #[arg(long)]
    max_breadth: Option<usize>,

    /// Wall-clock budget in seconds (overrides research.time_budget_secs).
    #[arg(long)]
    time_budget: Option<u64>,

    /// Engine tried once when the selected one is rate limited.
    #[arg(long)]
    fallback: Option<EngineKind>,

    /// Produce a concise answer instead of a full report.
    #[arg(long)]
    answer: bool,

    /// Print the session outcome as JSON instead of Markdown.
    #[arg(long)]
    json: bool,

    /// Write the explainability trace to this file.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Optional session ID (random UUID when omitted).
    #[arg(long)]
    session: Option<String>,

    /// Skip the JSONL session audit log.
    #[arg(long)]
    no_log: bool,
}

#[derive(Args, Debug)]
struct ClarifyArgs {
    #[arg(long)]
    query: String,

    /// Maximum number of questions.
    #[arg(long, default_value_t = 3)]
    questions: usize,
}

#[derive(Args, Debug)]
struct PurgeArgs {
    #[arg(long)]
    session: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;

    init_telemetry(TelemetryOptions {
        default_level: config.logging.level.clone(),
        ..TelemetryOptions::default()
    })?;
    deepdive_core::metrics::init_metrics_from_env("deepdive-cli");

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(&config, args).await?,
            Command::Clarify(args) => {
                let questions = clarifying_questions(&config, &args.query, args.questions).await?;
                if questions.is_empty() {
                    println!("The query is clear enough to research as is.");
                }
                for (idx, question) in questions.iter().enumerate() {
                    println!("{}. {question}", idx + 1);
                }
            }
            Command::PurgeLogs(args) => {
                remove_session_logs(&args.session)?;
                info!(session = %args.session, "session logs purged");
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn run_command(config: &deepdive_core::Config, args: RunArgs) -> Result<()> {
    let mut request = SessionRequest::new(args.query, args.engine, &config.research);
    if let Some(depth) = args.max_depth {
        request.max_depth = depth;
    }
    if let Some(breadth) = args.max_breadth {
        request.max_breadth = breadth;
    }
    if let Some(secs) = args.time_budget {
        request.time_budget = Duration::from_secs(secs);
    }
    if args.answer {
        request = request.with_mode(ReportMode::Answer);
    }

    let session_id = args.session.unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(
        session = %session_id,
        query = %request.query,
        engine = %request.engine,
        "starting research session"
    );

    let mut options = SessionOptions::new().with_session_id(session_id);
    if let Some(engine) = args.fallback {
        options = options.with_fallback_engine(engine);
    }

    let trace_task = args.trace_out.as_ref().map(|_| {
        let (collector, receiver) = EventCollector::new();
        options.events = Some(collector);
        tokio::spawn(async move {
            let mut trace = TraceCollector::new(receiver);
            trace.collect().await;
            trace
        })
    });

    let engine = request.engine;
    let result = run_research_session_with_options(config, request, options).await;

    // The orchestrator has been dropped by now, closing the event channel.
    let mut trace_path = None;
    if let (Some(task), Some(path)) = (trace_task, args.trace_out) {
        let trace = task.await.context("trace collector task failed")?;
        trace.persist(&path)?;
        info!(path = %path.display(), events = trace.events().len(), "trace written");
        trace_path = Some(path.display().to_string());
    }

    let outcome = result?;

    if !args.no_log {
        let mut entry = SessionLogInput::from_outcome(&outcome, engine);
        if let Some(path) = trace_path {
            entry = entry.with_trace_path(path);
        }
        if let Err(err) = log_session_completion(entry) {
            warn!(error = %err, "failed to write session log");
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.report.to_markdown());
        info!(
            session = %outcome.session_id,
            stop_reason = %outcome.stop_reason,
            rounds = outcome.stats.rounds,
            learnings = outcome.learnings.len(),
            "research session finished"
        );
    }
    Ok(())
}
