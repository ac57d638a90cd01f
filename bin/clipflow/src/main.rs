//! clipflow – operator CLI.
//!
//! Startup order:
//! 1. Parse arguments and configuration from environment variables.
//! 2. Initialise structured tracing.
//! 3. Open the SQLite session store and load the requested session.
//! 4. Run the command.
//! 5. Flush buffered session updates before exiting.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use clipflow_core::{
    ActiveSession, GenerationInput, LocalArtifactSink, Orchestrator, PollSummary, PollingEngine,
    SubmissionPipeline, SubmissionReport, Tag, TagSet,
};
use clipflow_http::{HttpArtifactFetcher, HttpDownstreamClient, HttpGenerationClient};
use clipflow_store::SqliteSessionStore;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "clipflow")]
#[command(about = "Drive image-to-video generation jobs from submission to downstream hand-off")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Work in the most recent session of this project (created if missing)
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// Work in this session id
    #[arg(short, long, global = true, conflicts_with = "project")]
    session: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit images for video generation
    Generate {
        /// Source image URLs, one job each
        #[arg(long = "image", required = true)]
        images: Vec<String>,

        /// Motion prompt shared by every job
        #[arg(long)]
        prompt: String,

        /// Provider parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Return after submitting instead of polling to completion
        #[arg(long)]
        no_poll: bool,
    },

    /// Poll every outstanding job in the session
    Poll,

    /// Submit downloaded videos to the material backend
    Submit {
        /// Target product id
        #[arg(long)]
        product: String,

        /// JSON file holding the tag tree
        #[arg(long)]
        tag_tree: PathBuf,

        /// Leaf tag ids to attach
        #[arg(long = "tag", required = true)]
        tags: Vec<u64>,
    },

    /// Print the session as JSON
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env();
    init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "clipflow starting");

    let store = SqliteSessionStore::connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening session store at {}", cfg.database_url))?;
    let session = ActiveSession::new(Arc::new(store), cfg.persist());
    match (&cli.session, &cli.project) {
        (Some(id), _) => {
            session.open(id).await?;
        }
        (None, Some(project)) => {
            session.open_project(project).await?;
        }
        (None, None) => bail!("pass --project or --session"),
    }
    let session_id = session.session_id().unwrap_or_default();
    info!(session_id = %session_id, "session loaded");

    let orchestrator = build_orchestrator(&cfg, session.clone())?;
    let outcome = tokio::select! {
        result = run(&cli.command, &orchestrator) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; saving session state");
            Ok(())
        }
    };

    if let Err(e) = session.flush().await {
        warn!(error = %e, "final session flush failed");
    }
    info!(session_id = %session_id, "clipflow stopped");
    outcome
}

fn init_tracing(cfg: &Config) {
    // Warn loudly if the configured value is not a valid filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: CLIPFLOW_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn build_orchestrator(cfg: &Config, session: ActiveSession) -> anyhow::Result<Orchestrator> {
    let provider = Arc::new(HttpGenerationClient::new(cfg.generation_http())?);
    let fetcher = Arc::new(HttpArtifactFetcher::new(&cfg.generation_http())?);
    let sink = Arc::new(LocalArtifactSink::new(&cfg.download_dir));
    let downstream = Arc::new(HttpDownstreamClient::new(cfg.downstream_http())?);

    let poller = PollingEngine::new(provider.clone(), fetcher, sink, cfg.poll());
    let submission = SubmissionPipeline::new(downstream, cfg.retry_policy());
    Ok(Orchestrator::new(session, provider, poller, submission))
}

async fn run(command: &Commands, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    match command {
        Commands::Generate {
            images,
            prompt,
            params,
            no_poll,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(params).context("--params must be a JSON object")?;
            let inputs = images
                .iter()
                .map(|url| GenerationInput {
                    image_name: image_name(url),
                    image_url: url.clone(),
                    prompt: prompt.clone(),
                })
                .collect();
            if *no_poll {
                let tasks = orchestrator.generate(inputs, params).await?;
                for task in tasks {
                    println!(
                        "{}\t{}\t{}",
                        task.image_name,
                        task.status,
                        task.task_id.as_deref().or(task.error.as_deref()).unwrap_or("-")
                    );
                }
            } else {
                print_poll(&orchestrator.generate_and_poll(inputs, params).await?);
            }
        }
        Commands::Poll => print_poll(&orchestrator.poll().await?),
        Commands::Submit {
            product,
            tag_tree,
            tags,
        } => {
            let raw = tokio::fs::read_to_string(tag_tree)
                .await
                .with_context(|| format!("reading {}", tag_tree.display()))?;
            let tree: Vec<Tag> = serde_json::from_str(&raw).context("parsing tag tree")?;
            let selected = TagSet::from_tree(&tree, tags)?;
            print_submission(&orchestrator.submit_downloaded(product, &selected).await?);
        }
        Commands::Show => {
            let session = orchestrator
                .session()
                .get()
                .context("no session loaded")?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
    }
    Ok(())
}

/// Last path segment of the URL without query or fragment.
fn image_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("image")
        .to_owned()
}

fn print_poll(summary: &PollSummary) {
    println!(
        "requested {}  downloaded {}  failed {}  pending {}{}",
        summary.requested,
        summary.completed,
        summary.failed,
        summary.pending.len(),
        if summary.timed_out { "  (timed out)" } else { "" }
    );
    for job_id in &summary.pending {
        println!("  still pending: {job_id}");
    }
}

fn print_submission(report: &SubmissionReport) {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(material_id) => println!("{}\tok\t{material_id}", outcome.image_name),
            Err(e) => println!("{}\tfailed\t{e}", outcome.image_name),
        }
    }
    println!("submitted {}  failed {}", report.succeeded(), report.failed());
}
