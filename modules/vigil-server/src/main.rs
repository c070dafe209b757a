use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use browserless_client::BrowserlessClient;
use classifier_client::{ClassifierClient, ClassifierOptions};
use vigil_common::{load_config, AppConfig, FileConfig, Store};
use vigil_moderation::ModerationDispatcher;
use vigil_store::PgStore;
use vigil_verification::{
    BrowserlessBackend, ClaudeVision, DomSelectors, EndpointSelector, ExtractionPipeline,
    PoolConfig, SessionPool, VerificationDispatcher, VisionModel,
};

/// How long in-flight work may run after a stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "vigil", about = "Relay post-ingestion moderation and identity verification")]
struct Cli {
    /// Path to config TOML file
    #[arg(long, default_value = "./config/vigil.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting vigil");

    let cli = Cli::parse();
    let config_path = cli.config.canonicalize().with_context(|| {
        format!(
            "Config file not found: {}. Create one or specify --config <path>",
            cli.config.display()
        )
    })?;
    tracing::info!(config = %config_path.display(), "Loading config");
    let file_config = load_config(&config_path)?;

    let env = AppConfig::from_env()?;

    let store = PgStore::connect(&env.database_url).await?;
    store.migrate().await?;
    tracing::info!("Connected to database, migrations complete");
    let store: Arc<dyn Store> = Arc::new(store);

    let moderation = Arc::new(build_moderation(&env, &file_config, store.clone())?);
    let verification = Arc::new(build_verification(&env, &file_config, store)?);

    let shutdown = CancellationToken::new();
    let moderation_task = tokio::spawn(moderation.run(shutdown.clone()));
    let verification_task = tokio::spawn(verification.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, stopping pipelines");
    shutdown.cancel();

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(moderation_task, verification_task);
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "In-flight work did not finish within grace period"
        );
    }

    tracing::info!("Vigil stopped");
    Ok(())
}

fn build_moderation(
    env: &AppConfig,
    config: &FileConfig,
    store: Arc<dyn Store>,
) -> Result<ModerationDispatcher> {
    let c = &config.classifier;
    let options = ClassifierOptions {
        api_key: env.classifier_api_key.clone(),
        enabled: c.enabled,
        moderation_mode: c.moderation_mode.clone(),
        threshold: c.threshold,
        dispute_threshold: c.dispute_threshold,
        request_timeout: Duration::from_secs(c.request_timeout_secs),
        download_timeout: Duration::from_secs(c.download_timeout_secs),
        max_download_bytes: c.max_download_bytes,
        ..ClassifierOptions::new(&c.endpoint, config.moderation.temp_dir.clone())
    };
    let classifier = ClassifierClient::new(options).context("Failed to build classifier client")?;
    if !classifier.is_enabled() {
        tracing::warn!("Media classification disabled, every item will be allowed");
    }

    Ok(ModerationDispatcher::new(
        store,
        Arc::new(classifier),
        config.moderation.clone(),
    ))
}

fn build_verification(
    env: &AppConfig,
    config: &FileConfig,
    store: Arc<dyn Store>,
) -> Result<VerificationDispatcher> {
    let browser = &config.browser;
    let client = BrowserlessClient::new(
        &env.browserless_url,
        env.browserless_token.as_deref(),
        Duration::from_secs(browser.navigation_timeout_secs),
    )
    .context("Failed to build browserless client")?;
    let backend = BrowserlessBackend::new(client, Duration::from_secs(browser.navigation_timeout_secs));
    let pool = Arc::new(SessionPool::new(Arc::new(backend), PoolConfig::from(browser)));

    if config.mirrors.endpoints.is_empty() {
        tracing::warn!("No mirror endpoints configured, verification attempts will fail");
    }
    let selector = Arc::new(EndpointSelector::from_config(&config.mirrors));

    let vision: Option<Arc<dyn VisionModel>> = match &env.anthropic_api_key {
        Some(key) => Some(Arc::new(ClaudeVision::new(key, &config.vision.model))),
        None => {
            tracing::info!("ANTHROPIC_API_KEY not set, visual extraction disabled");
            None
        }
    };
    let pipeline = Arc::new(ExtractionPipeline::new(
        DomSelectors::from(browser),
        vision,
        config.verification.consensus_passes,
    )
    .with_vision_timeout(config.vision.request_timeout()));

    Ok(VerificationDispatcher::new(
        store,
        pool,
        selector,
        pipeline,
        config.verification.clone(),
    ))
}
