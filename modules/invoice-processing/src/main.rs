use event_bus::{BusConfig, EventBus, InMemoryBus};
use invoice_processing::consumer::register_stage_consumers;
use invoice_processing::{Config, InvoiceService, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().expect("Invalid configuration");

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::with_config(BusConfig {
        stream_retention: config.stream_retention,
        pool_size: config.consumer_pool_size,
        ..BusConfig::default()
    }));

    let registry = ServiceRegistry::in_memory(bus.clone());
    let service = Arc::new(InvoiceService::new(registry));

    register_stage_consumers(&bus, &service)
        .await
        .expect("Failed to subscribe stage consumers");
    bus.start_consumers()
        .await
        .expect("Failed to start consumers");

    // Periodic SLA sweep drives reminders and escalations
    let sweeper = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            match sweeper.sweep_slas().await {
                Ok(actions) if !actions.is_empty() => {
                    tracing::info!(count = actions.len(), "SLA escalations dispatched");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "SLA sweep failed"),
            }
        }
    });

    tracing::info!("Invoice processing module running");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("Shutdown signal received");

    bus.shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await;
}
