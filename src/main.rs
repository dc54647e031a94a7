use etcd_config_source::Error;
use etcd_config_source::EtcdConfigSource;
use etcd_config_source::Result;
use etcd_config_source::SourceConfig;
use etcd_config_source::UNBOUNDED_DEMAND;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tracing::error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    // Initializing Logs
    init_observability();

    let settings = SourceConfig::new()?.validate()?;
    info!(endpoint = %settings.endpoint, key = %settings.key, api = %settings.api, "starting");

    let source = EtcdConfigSource::open(settings).await?;
    let initial = source.initial();
    info!(
        revision = initial.revision,
        content = %String::from_utf8_lossy(&initial.content),
        "initial configuration"
    );

    let subscription = source.subscribe()?;
    subscription.request(UNBOUNDED_DEMAND);

    tokio::select! {
        _ = async {
            while let Some(item) = subscription.next().await {
                match item {
                    Ok(snapshot) => info!(
                        revision = snapshot.revision,
                        content = %String::from_utf8_lossy(&snapshot.content),
                        "configuration changed"
                    ),
                    Err(e) => error!(backend = ?e.backend(), "subscription ended: {}", e),
                }
            }
        } => {
            info!("subscription finished");
        }
        result = shutdown_signal() => {
            result?;
            subscription.cancel();
        }
    }

    source.close();
    info!(
        fetches = source.stats().fetches(),
        deliveries = source.stats().deliveries(),
        "Exiting program."
    );
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigint =
        signal(SignalKind::interrupt()).map_err(|e| Error::Fatal(format!("Failed to install SIGINT handler: {}", e)))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| Error::Fatal(format!("Failed to install SIGTERM handler: {}", e)))?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }
    Ok(())
}

pub fn init_observability() {
    let base_subscriber = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(base_subscriber).init();
}
