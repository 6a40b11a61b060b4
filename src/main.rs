use anyhow::Result;
use clap::{Parser, Subcommand};
use ragline::config::RagConfig;
use ragline::embedder::{Embedder, TextEmbedder};
use ragline::execution;
use ragline::ingest::{IngestEvent, IngestSession};
use ragline::pipeline::QueryPipeline;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "ragline", version, about = "Local-first RAG over your documents")]
struct Cli {
    /// Path to the TOML configuration file (default: ./ragline.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index a folder of documents
    Ingest {
        folder: PathBuf,
        /// Wipe all stores and rebuild from scratch
        #[arg(long)]
        fresh: bool,
    },
    /// Ask a question against the indexed corpus
    Query {
        question: Vec<String>,
        /// Number of source chunks handed to the LLM
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RagConfig::load(cli.config.as_deref())?;
    let _log_guard = init_tracing(&config);

    // Log panics before the default hook aborts.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        error!(target: "ragline::panic", location = %location, "PANIC: {}", panic_info);
        default_panic(panic_info);
    }));

    let provider = execution::resolve_execution_provider(
        config.execution_provider_preference,
        config.gpu_device_id,
    )?;
    if provider.fallback_to_cpu {
        info!("No accelerator found, running inference on CPU");
    }

    match cli.command {
        Command::Ingest { folder, fresh } => {
            let embedder: Arc<dyn TextEmbedder> = Arc::new(Embedder::new(&config, provider)?);
            let mut session = IngestSession::open(config, embedder).await?;

            // Ctrl+C cancels cooperatively: the current batch completes,
            // then the session stops.
            let cancel = CancellationToken::new();
            let cancel_on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl+C received, cancelling ingest after the current batch");
                    cancel_on_signal.cancel();
                }
            });

            let mut events = session.subscribe();
            let progress = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        IngestEvent::Started { total_files } => {
                            println!("Indexing {} files...", total_files);
                        }
                        IngestEvent::FileIndexed { path, chunks } => {
                            println!("  indexed {} ({} chunks)", path, chunks);
                        }
                        IngestEvent::FileSkipped { path, reason } => {
                            println!("  skipped {}: {}", path, reason);
                        }
                        IngestEvent::Completed { files, chunks, duration_ms } => {
                            println!(
                                "Done: {} files, {} chunks in {:.1}s",
                                files,
                                chunks,
                                duration_ms as f64 / 1000.0
                            );
                        }
                    }
                }
            });

            let summary = session.run(&folder, fresh, &cancel).await?;
            drop(session);
            let _ = progress.await;
            info!(
                files = summary.files_indexed,
                skipped = summary.files_skipped,
                chunks = summary.chunks_indexed,
                "Ingest finished"
            );
        }
        Command::Query { question, top_k } => {
            let question = question.join(" ");
            if question.trim().is_empty() {
                anyhow::bail!("empty question; usage: ragline query <question...>");
            }

            let pipeline = QueryPipeline::open(&config, provider).await?;

            // Queries cancel end-to-end: the first await after Ctrl+C
            // propagates the cancellation.
            let result = tokio::select! {
                result = pipeline.answer(&question, top_k) => result?,
                _ = tokio::signal::ctrl_c() => {
                    anyhow::bail!("query cancelled");
                }
            };

            println!("{}\n", result.answer.trim());
            if !result.sources.is_empty() {
                println!("Sources:");
                for record in &result.sources {
                    println!("  [{}] {}", record.id, record.source_uri);
                }
            }
        }
    }

    Ok(())
}

/// Compact stdout layer plus a daily-rotated file layer, both behind an env
/// filter defaulting to `ragline=info`.
fn init_tracing(config: &RagConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ragline=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    let log_dir = config.log_dir();
    let file_layer_and_guard = std::fs::create_dir_all(&log_dir).ok().map(|_| {
        let appender = tracing_appender::rolling::daily(&log_dir, "ragline.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer)
            .compact();
        (layer, guard)
    });

    match file_layer_and_guard {
        Some((file_layer, guard)) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            None
        }
    }
}
