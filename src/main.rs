use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tonic::transport::Server as TonicServer;
use tracing::{error, info, warn};

use turnstile::bus::{EventBus, KafkaEventBus};
use turnstile::config::AppConfig;
use turnstile::domain::Provider;
use turnstile::engine::LifecycleEngine;
use turnstile::metrics::Metrics;
use turnstile::providers::{
    AdapterRegistry, PayOsAdapter, ProviderAdapter, VnPayAdapter, ZaloPayAdapter,
};
use turnstile::publisher::OutboxPublisher;
use turnstile::server::grpc_handler::{PaymentGrpcHandler, PaymentServiceServer};
use turnstile::server::webhook_handler::{self, WebhookState};
use turnstile::store::{self, OutboxQueue, OutboxStore, PaymentStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnstile=debug,info".into()),
        )
        .init();

    let cfg = AppConfig::load()?;
    info!("starting turnstile");

    let pool = store::connect(&cfg.database_url).await?;
    let bus: Arc<dyn EventBus> = Arc::new(KafkaEventBus::connect(&cfg.kafka).await?);

    let payments = PaymentStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let metrics = Arc::new(Metrics::new());

    let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
        Arc::new(ZaloPayAdapter::new(
            cfg.zalopay.clone(),
            cfg.callback_url(Provider::Zalopay),
        )),
        Arc::new(PayOsAdapter::new(cfg.payos.clone())),
        Arc::new(VnPayAdapter::new()),
    ];
    let adapters = Arc::new(AdapterRegistry::new(adapters));

    let engine = Arc::new(LifecycleEngine::new(
        pool.clone(),
        payments,
        outbox.clone(),
        adapters.clone(),
        metrics.clone(),
    ));

    let outbox_queue: Arc<dyn OutboxQueue> = Arc::new(outbox);
    let publisher = Arc::new(OutboxPublisher::new(
        outbox_queue,
        bus.clone(),
        cfg.outbox.clone(),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher_handle = tokio::spawn(publisher.clone().run(shutdown_rx.clone()));
    let cleanup_handle = tokio::spawn(publisher.clone().run_cleanup(shutdown_rx.clone()));
    let exhausted_handle = tokio::spawn(publisher.clone().run_exhausted_scan(shutdown_rx.clone()));

    // http server: webhook ingress, health, metrics
    let webhook_state = WebhookState {
        engine: engine.clone(),
        adapters,
        metrics: metrics.clone(),
    };
    let http_app = webhook_handler::router(webhook_state);
    let http_addr: SocketAddr = cfg.http_addr.parse()?;
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!(address = %cfg.http_addr, "http server starting");

    // grpc server: payment intent surface
    let grpc_handler = PaymentGrpcHandler::new(engine);
    let grpc_addr: SocketAddr = cfg.grpc_addr.parse()?;
    let grpc_server = TonicServer::builder()
        .add_service(PaymentServiceServer::new(grpc_handler))
        .serve(grpc_addr);
    info!(address = %cfg.grpc_addr, "grpc server starting");

    tokio::select! {
        result = grpc_server => {
            if let Err(e) = result {
                error!("grpc server error: {e}");
            }
        }
        result = axum::serve(http_listener, http_app) => {
            if let Err(e) = result {
                error!("http server error: {e}");
            }
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = publisher_handle.await;
        let _ = cleanup_handle.await;
        let _ = exhausted_handle.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("publisher did not drain within the grace window");
    }
    bus.disconnect().await;
    pool.close().await;

    info!("turnstile stopped");
    Ok(())
}
