use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use bat_gateway::config;
use bat_gateway::db::Database;
use bat_gateway::query::{QueryLimits, TraceQuery};
use bat_gateway::recorder::{FlushWindow, TraceCache, TraceRecorder};
use bat_gateway::Gateway;
use bat_types::config::BatConfig;
use bat_types::rpc::RpcRequest;
use bat_types::trace::{AgentEvent, AgentEventPayload, TraceRunMeta};

#[derive(Parser)]
#[command(name = "batchismo", version, about = "Batchismo agent gateway trace tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current status
    Status,
    /// Inspect recorded agent runs
    Trace {
        #[command(subcommand)]
        command: TraceCommands,
    },
    /// Call a gateway RPC method against the local trace store
    Rpc {
        /// Method name, e.g. trace.runs.list
        method: String,
        /// JSON params object
        params: Option<String>,
    },
}

#[derive(Subcommand)]
enum TraceCommands {
    /// List recent runs, most recent first
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Replay the event log of one run
    Show {
        run_id: String,
        #[arg(long)]
        limit: Option<usize>,
        /// Only show events after this sequence number
        #[arg(long)]
        after_seq: Option<u64>,
        /// Print raw event records as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Recompute every run summary from the event logs
    Reindex,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.gateway.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Status => status(&cfg),
        Commands::Trace { command } => trace(&cfg, command),
        Commands::Rpc { method, params } => rpc(cfg, method, params).await,
    }
}

fn open_db() -> Result<Arc<Database>> {
    let path = config::db_path()?;
    let db = Database::open(&path)
        .with_context(|| format!("Failed to open trace database at {}", path.display()))?;
    Ok(Arc::new(db))
}

fn status(cfg: &BatConfig) -> Result<()> {
    let db = open_db()?;
    println!("Batchismo v{}", env!("CARGO_PKG_VERSION"));
    println!("Tracing: {}", if cfg.trace.enabled { "enabled" } else { "disabled" });
    println!("Flush debounce: {}ms", cfg.trace.flush_debounce_ms);
    println!("Recorded runs: {}", db.count_trace_runs()?);
    println!("Config: {}", config::config_path()?.display());
    println!("Database: {}", config::db_path()?.display());
    Ok(())
}

fn trace(cfg: &BatConfig, command: TraceCommands) -> Result<()> {
    let db = open_db()?;
    let query = TraceQuery::new(
        Arc::clone(&db),
        Arc::new(TraceCache::new()),
        QueryLimits::from(&cfg.trace),
    );

    match command {
        TraceCommands::List { limit } => {
            let runs = query.list_trace_runs(limit);
            if runs.is_empty() {
                println!("No recorded runs.");
            }
            for run in &runs {
                println!("{}", describe_run(run));
            }
        }
        TraceCommands::Show {
            run_id,
            limit,
            after_seq,
            json,
        } => {
            if let Some(run) = query.get_trace_run(&run_id) {
                if !json {
                    println!("{}", describe_run(&run));
                }
            }
            let page = query.get_trace_run_events(&run_id, limit, after_seq);
            for event in &page.events {
                if json {
                    println!("{}", serde_json::to_string(event)?);
                } else {
                    println!("  {}", describe_event(event));
                }
            }
            if page.truncated {
                let last = page.events.last().map(|e| e.seq).unwrap_or(0);
                eprintln!("(more events; continue with --after-seq {last})");
            }
        }
        TraceCommands::Reindex => {
            let recorder = TraceRecorder::new(
                db,
                Arc::new(TraceCache::new()),
                FlushWindow::from(&cfg.trace),
            );
            let count = recorder.rebuild_index()?;
            println!("Rebuilt {count} run summaries.");
        }
    }
    Ok(())
}

async fn rpc(cfg: BatConfig, method: String, params: Option<String>) -> Result<()> {
    let params = match params {
        Some(raw) => serde_json::from_str(&raw).context("params must be a JSON value")?,
        None => serde_json::Value::Null,
    };
    let gateway = Gateway::new(cfg, open_db()?)?;
    let response = gateway
        .handle_rpc(RpcRequest {
            id: "cli".to_string(),
            method,
            params,
        })
        .await;
    gateway.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn describe_run(run: &TraceRunMeta) -> String {
    format!(
        "{}  {:<8} tools={} errors={}  session={}  started={}",
        run.run_id,
        run.status.to_string(),
        run.tool_calls,
        run.tool_errors,
        run.session_key.as_deref().unwrap_or("-"),
        format_ms(run.recency()),
    )
}

fn describe_event(event: &AgentEvent) -> String {
    let detail = match &event.payload {
        AgentEventPayload::Lifecycle(d) => d.error.clone().unwrap_or_default(),
        AgentEventPayload::Tool(d) => match d.is_error {
            Some(true) => format!("{} ({}) error", d.name, d.tool_call_id),
            _ => format!("{} ({})", d.name, d.tool_call_id),
        },
        AgentEventPayload::Message(d) => d.delta.clone().unwrap_or_default(),
        AgentEventPayload::Compaction(d) => match d.will_retry {
            Some(true) => "will retry".to_string(),
            _ => String::new(),
        },
    };
    format!(
        "#{:<4} {}  {:<10} {:<6} {}",
        event.seq,
        format_ms(event.ts),
        event.stream().to_string(),
        event.payload.phase(),
        detail
    )
}
