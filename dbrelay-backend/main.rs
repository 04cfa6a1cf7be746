mod adapter;
mod api;
mod config;
mod datasources;
mod errors;
mod executor;
mod sandbox;
mod service;
mod vault;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::io::Read;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::datasources::file_repository::FileDataSourceRepository;
use crate::datasources::repository::DataSourceRepository;
use crate::executor::CommandExecutor;
use crate::sandbox::{PoolConfig, SandboxPool};
use crate::service::DataSourceService;
use crate::vault::CredentialVault;

#[derive(Parser)]
#[command(name = "dbrelay", about = "Sandboxed database access for AI agents")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Encrypt a secret read from stdin into the stored credential form
    Encrypt,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow --help
    // and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    match cli {
        Cli::Serve => run_server().await?,
        Cli::Encrypt => encrypt_stdin()?,
    }
    Ok(())
}

fn encrypt_stdin() -> Result<()> {
    let config = config::Config::from_env()?;
    let vault = CredentialVault::from_base64_key(&config.encryption_key).context("invalid DBRELAY_ENCRYPTION_KEY")?;

    let mut secret = String::new();
    std::io::stdin()
        .read_to_string(&mut secret)
        .context("failed to read secret from stdin")?;
    let secret = secret.trim_end_matches(['\r', '\n']);

    println!("{}", vault.encrypt(secret)?);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dbrelay=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

async fn run_server() -> Result<()> {
    let config = config::Config::from_env()?;
    init_tracing();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: false,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let vault = Arc::new(
        CredentialVault::from_base64_key(&config.encryption_key).context("invalid DBRELAY_ENCRYPTION_KEY")?,
    );

    let repo: Arc<dyn DataSourceRepository> = Arc::new(FileDataSourceRepository::new(&config.data_dir));
    repo.load_all().await.context("failed to load datasources")?;

    let provider = sandbox::build_provider(config.sandbox.clone()).context("failed to initialize sandbox provider")?;
    let pool = SandboxPool::open(provider, PoolConfig::default());

    let app_state = api::AppState {
        pool: pool.clone(),
        datasources: Arc::new(DataSourceService::new(repo.clone(), vault.clone())),
        executor: Arc::new(CommandExecutor::new(pool.clone(), repo, vault)),
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = config.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(data_dir = %config.data_dir.display(), "listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.destroy().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received, draining requests");
}
