use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lead_pilot::channels::{ImapMailbox, Mailbox, spawn_email_poller};
use lead_pilot::config::PilotConfig;
use lead_pilot::dashboard::dashboard_routes;
use lead_pilot::pipeline::Pipeline;
use lead_pilot::pipeline::sweep::spawn_sweeper;
use lead_pilot::services::Services;
use lead_pilot::store::{Database, LibSqlBackend};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = PilotConfig::from_env();
    config
        .pipeline
        .validate()
        .context("Invalid pipeline configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("🧭 Lead Pilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Dashboard WS: ws://0.0.0.0:{}/ws", config.port);
    eprintln!("   API: http://0.0.0.0:{}/api/leads", config.port);
    eprintln!("   Database: {}", config.db_path.display());
    match &config.services.llm {
        Some(llm) => eprintln!(
            "   Model: {} (replies: {})",
            llm.model,
            llm.classification_model()
        ),
        None => eprintln!("   Model: none (keyword classifier only)"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let services = Services::from_config(&config.services);
    eprintln!("   Services: {}\n", services.enabled().join(", "));

    let pipeline = Pipeline::open(Some(db), services, config.pipeline.clone())
        .await
        .context("Failed to load pipeline state")?;
    tracing::info!(
        leads = pipeline.leads().len().await,
        pending_requests = pipeline.gate().list_pending().await.len(),
        "Pipeline state loaded"
    );

    if config.pipeline.human_request_ttl.is_some() || config.pipeline.no_response_after.is_some() {
        spawn_sweeper(Arc::clone(&pipeline), SWEEP_INTERVAL);
    }

    if let Some(email_config) = config.services.email.clone() {
        let mailbox = ImapMailbox::new(email_config);
        let interval = mailbox.poll_interval();
        let own_address = mailbox.own_address().to_string();
        spawn_email_poller(
            Arc::new(mailbox) as Arc<dyn Mailbox>,
            own_address,
            interval,
            Arc::clone(&pipeline),
        );
    } else {
        tracing::info!("Email not configured, inbound replies only via webhook");
    }

    // ── HTTP / WS server ─────────────────────────────────────────────────
    let app = dashboard_routes(pipeline);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Dashboard server started");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(config: &PilotConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lead-pilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
