use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wordsmith_agents::provider::check_endpoint;
use wordsmith_agents::{
    parse_word_list, AgentsConfig, CardGenerator, ImageGenerator, ModelInvoker, ModelRouter,
    OfflineInvoker, OpenAiCompatInvoker, OpenAiImageGenerator,
};
use wordsmith_coordination::{
    ConsensusInvoker, DivergenceSink, JsonlDivergenceSink, PoolRegistry, TracingDivergenceSink,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (defaults plus WORDSMITH_* overrides when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate vocabulary cards for a word list and print a JSON report
    Cards {
        /// Word list: JSON array of {id, term, context?} or one term per line
        #[arg(long)]
        words: PathBuf,

        /// Use deterministic offline providers instead of HTTP endpoints
        #[arg(long, default_value_t = false)]
        offline: bool,

        /// Override the card-phase worker count
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Check that every configured endpoint answers `GET /models`
    Endpoints,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = AgentsConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Cards {
            words,
            offline,
            concurrency,
        } => {
            if let Some(n) = concurrency {
                config.engine.batch.max_concurrency = n;
                config.validate()?;
            }
            run_cards(&config, &words, offline).await
        }
        Command::Endpoints => {
            for endpoint in &config.endpoints {
                let key = endpoint.api_key();
                let up = check_endpoint(&endpoint.base_url, key.as_deref()).await;
                info!(
                    provider = %endpoint.provider,
                    url = %endpoint.base_url,
                    api_key = key.is_some(),
                    reachable = up,
                    "Endpoint"
                );
            }
            Ok(())
        }
    }
}

async fn run_cards(config: &AgentsConfig, words_path: &Path, offline: bool) -> Result<()> {
    let raw = std::fs::read_to_string(words_path)
        .with_context(|| format!("Failed to read word list {}", words_path.display()))?;
    let words = parse_word_list(&raw)?;
    info!(
        words = words.len(),
        offline,
        concurrency = config.engine.batch.max_concurrency,
        "Wordsmith starting"
    );

    let pools = PoolRegistry::from_quotas(&config.engine.providers)?;
    let offline_invoker = offline.then(|| Arc::new(OfflineInvoker::new()));

    let router = ModelRouter::from_config(
        config,
        &pools,
        offline_invoker
            .clone()
            .map(|o| o as Arc<dyn ModelInvoker>),
    )?;

    let images: Arc<dyn ImageGenerator> = match &offline_invoker {
        Some(o) => o.clone() as Arc<dyn ImageGenerator>,
        None => {
            let endpoint = config
                .endpoint(&config.models.image_provider)
                .context("Image provider has no endpoint")?;
            let http = OpenAiCompatInvoker::new(
                &endpoint.provider,
                &endpoint.base_url,
                endpoint.api_key(),
                Duration::from_secs(config.request_timeout_secs),
            )?;
            Arc::new(OpenAiImageGenerator::new(http, &config.models.image_model))
        }
    };

    let sink: Arc<dyn DivergenceSink> = match &config.engine.divergence_log {
        Some(path) => {
            info!(path = %path.display(), "Recording divergence to JSONL");
            Arc::new(JsonlDivergenceSink::new(path))
        }
        None => Arc::new(TracingDivergenceSink),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing in-flight words");
                cancel.cancel();
            }
        });
    }

    let mut generator = CardGenerator::new(
        Arc::new(router),
        images,
        ConsensusInvoker::new(sink),
        config.models.clone(),
        config.engine.batch.clone(),
    )
    .with_cancellation(cancel);
    if let Some(pool) = pools.get(&config.models.image_provider) {
        generator = generator.with_image_pool(pool);
    }

    let run = generator.run(words).await?;

    for snapshot in pools.snapshots() {
        info!(
            pool = %snapshot.name,
            granted = snapshot.granted_in_window,
            in_flight = snapshot.in_flight,
            "Pool usage"
        );
    }

    let report = serde_json::to_string_pretty(&run).context("Failed to serialize report")?;
    println!("{report}");
    Ok(())
}
