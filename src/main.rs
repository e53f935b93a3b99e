use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

use storefront_api as api;
use api::services::notifications::{LogNotifier, Notifier, RelayNotifier};
use api::services::payments::{PaymentProvider, StripeClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    let provider: Arc<dyn PaymentProvider> = Arc::new(
        StripeClient::new(cfg.payment_api_base.clone(), cfg.payment_secret_key.clone())
            .context("failed to build payment provider client")?,
    );
    if cfg.payment_secret_key.trim().is_empty() {
        warn!("Payment secret key not configured; refunds and checkout will fail");
    }

    let notifier: Arc<dyn Notifier> = match cfg.notification_relay_url.clone() {
        Some(url) => {
            info!("Notification relay enabled");
            Arc::new(
                RelayNotifier::new(
                    url,
                    cfg.notification_from.clone(),
                    cfg.internal_alert_email.clone(),
                )
                .context("failed to build notification relay client")?,
            )
        }
        None => {
            info!("Notification relay not configured; notifications are logged only");
            Arc::new(LogNotifier)
        }
    };

    // Shared admission buckets (construction only; failures fall back to local buckets)
    let redis = if cfg.rate_limit_use_redis {
        Some(Arc::new(
            redis::Client::open(cfg.redis_url.clone()).context("invalid redis url")?,
        ))
    } else {
        warn!("Admission control is process-local; buckets are not shared across instances");
        None
    };

    let port = cfg.port;
    let host = cfg.host.clone();
    let sweep_every = Duration::from_secs(
        cfg.rate_limit_refund_interval_secs
            .min(cfg.rate_limit_webhook_interval_secs)
            .max(1),
    );
    let state = api::AppState::new(db, cfg, provider, notifier, redis);

    if !state.credentials.is_configured() {
        warn!("No internal key configured; internal endpoints will reject every call");
    }

    let _sweeper = api::rate_limiter::spawn_idle_sweeper(
        vec![
            state.refund_admission.clone(),
            state.webhook_admission.clone(),
        ],
        sweep_every,
    );

    let app = api::app_router(state).layer(TimeoutLayer::new(Duration::from_secs(30)));

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));
    info!("storefront-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
