use apsis::credential_provider::HttpCredentialProvider;
use apsis::notify::{NoopNotifier, NotificationSink, WebhookNotifier};
use apsis::rotation::RotationEngine;
use apsis::secret_cache::{AesGcmCodec, PlainCodec, SecretCodec};
use apsis::{fleet_sync, jobs, settings, storage, web};
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use migration::MigratorTrait;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "apsis",
    version,
    about = "Device fleet credential rotation service"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(
        host = %settings.server.host,
        port = settings.server.port,
        database = %settings.database.url,
        provider = %settings.provider.base_url,
        "Loaded configuration"
    );

    // init storage (database) and apply migrations
    let db = storage::init(&settings.database).await?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;

    // secret codec
    let codec: Arc<dyn SecretCodec> = match &settings.rotation.secret_passphrase {
        Some(passphrase) => Arc::new(AesGcmCodec::new(passphrase)?),
        None => {
            tracing::warn!("No secret passphrase configured; device secrets are stored in plain form");
            Arc::new(PlainCodec)
        }
    };

    // credential provider client
    let provider = Arc::new(HttpCredentialProvider::new(&settings.provider)?);

    // notification sink
    let notifier: Arc<dyn NotificationSink> = if settings.notify.device_webhook_url.is_none()
        && settings.notify.dashboard_webhook_url.is_none()
    {
        Arc::new(NoopNotifier)
    } else {
        Arc::new(WebhookNotifier::new(&settings.notify))
    };

    let engine = RotationEngine::new(
        db,
        provider,
        codec,
        notifier,
        settings.rotation.clone(),
    );

    // repair anything a previous process left half-rotated
    match engine.reconcile_partial_rotations().await {
        Ok(0) => {}
        Ok(repaired) => tracing::warn!(repaired, "Startup reconciliation repaired devices"),
        Err(e) => tracing::warn!("Startup reconciliation failed: {}", e),
    }

    // provision devices from file if configured
    if let Some(devices_file) = &settings.fleet.devices_file {
        fleet_sync::sync_devices_from_file(&engine, devices_file).await?;
    }

    // start background jobs
    let _scheduler = jobs::init_scheduler(engine.clone(), &settings.rotation).await?;

    // start web server
    web::serve(settings, engine).await?;
    Ok(())
}
