use billing_engine::api::{self, AppState};
use billing_engine::config::Config;
use billing_engine::mqtt::{self, Inbound, MqttTransport};
use billing_engine::{
    db, AccumulatorSettings, BillingCalculator, EnergyAccumulator, EngineMetrics, IngestGateway,
    PersistencePool, PgStore, SnapshotPublisher, Store,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting billing-engine");

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(homes = cfg.billing.homes.len(), "configuration loaded");

    let offset = cfg
        .billing
        .utc_offset()
        .ok_or_else(|| anyhow::anyhow!("invalid utc offset {}", cfg.billing.utc_offset_hours))?;

    let pool = db::connect(&cfg.database.url, cfg.database.max_connections).await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("connected to database");

    let sample_interval = Duration::from_secs(cfg.billing.sample_interval_secs);
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool, sample_interval));
    let metrics = Arc::new(EngineMetrics::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let persistence = PersistencePool::start(
        store.clone(),
        &cfg.persistence,
        metrics.clone(),
        shutdown_rx.clone(),
    );
    let accumulator = Arc::new(EnergyAccumulator::new(
        cfg.billing.homes.clone(),
        cfg.billing.device_categories.clone(),
        AccumulatorSettings::from(&cfg.billing),
        persistence.handle(),
    ));
    // Today's energy so far survives a restart through the raw-reading store
    accumulator
        .restore_from(store.as_ref(), chrono::Utc::now())
        .await?;

    let calculator = Arc::new(BillingCalculator::new(
        accumulator.clone(),
        store.clone(),
        offset,
        metrics.clone(),
    ));

    let opts = mqtt::build_options(&cfg.mqtt);
    let (client, mut eventloop) = mqtt::new(opts);
    let qos = mqtt::qos(cfg.mqtt.qos);

    let publisher = Arc::new(SnapshotPublisher::new(
        cfg.billing.homes.clone(),
        calculator.clone(),
        accumulator.clone(),
        Arc::new(MqttTransport::new(client.clone(), qos)),
        persistence.handle(),
        metrics.clone(),
    ));
    let publisher_task =
        tokio::spawn(publisher.run(cfg.billing.tick_interval(), shutdown_rx.clone()));

    let state = AppState {
        calculator,
        accumulator: accumulator.clone(),
        store,
        metrics: metrics.clone(),
        default_home: cfg.billing.homes[0].clone(),
    };
    let router = api::create_router(state);
    let addr = format!("{}:{}", cfg.api.host, cfg.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;
    info!("API server listening on {}", addr);

    let mut api_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = api_shutdown.wait_for(|s| *s).await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let gateway = IngestGateway::new(accumulator, metrics);
    let sig = shutdown_signal();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                break;
            }
            res = mqtt::next_inbound(&mut eventloop) => {
                match res {
                    Ok(Inbound::Connected) => {
                        match mqtt::subscribe_homes(&client, &cfg.billing.homes, qos) {
                            Ok(()) => info!(
                                homes = cfg.billing.homes.len(),
                                "connected; subscribed to reading topics"
                            ),
                            Err(e) => warn!(error = %e, "failed to subscribe to reading topics"),
                        }
                    }
                    Ok(Inbound::Publish(msg)) => {
                        let topic = match std::str::from_utf8(&msg.topic) {
                            Ok(s) => s,
                            Err(_) => {
                                warn!(topic = ?msg.topic, "non-utf8 topic; skipping message");
                                continue;
                            }
                        };
                        // Rejections are logged and counted by the gateway
                        if gateway.handle_message(topic, msg.payload.as_ref()).is_err() {
                            debug!(topic = %topic, "reading rejected");
                        }
                    }
                    Err(e) => {
                        warn!("mqtt error: {e}; reconnecting after short delay");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "mqtt disconnect failed");
    }
    let _ = publisher_task.await;
    let _ = server_task.await;
    persistence
        .join(Duration::from_secs(cfg.persistence.shutdown_grace_secs))
        .await;

    info!("Application shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
