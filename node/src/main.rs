use log::{error, info, warn};

use mockroute_lib::keys::PrivateKey;
use mockroute_node::{new_dht, Config, Context, DhtConfig, MapDatastore, MutexDatastore, TcpHost};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env();
    let key = match &config.private_key_hex {
        Some(hex) => PrivateKey::from_hex(hex)?,
        None => {
            let key = PrivateKey::generate();
            info!("No NODE_KEY set, generated a fresh identity");
            key
        }
    };

    let host = TcpHost::bind(&key, &config.address).await?;
    let datastore = MutexDatastore::shared(MapDatastore::new());
    let node = new_dht(&Context::background(), host, datastore, DhtConfig::default()).await?;

    info!(
        "Node {} listening on {}",
        hex::encode(node.info.id),
        node.info.address
    );

    if let Some(bootstrap) = &config.bootstrap_address {
        match node.bootstrap(std::slice::from_ref(bootstrap)).await {
            Ok(size) => info!("Joined network via {} ({} peers known)", bootstrap, size),
            Err(e) => warn!("Could not join via {}: {}, running standalone", bootstrap, e),
        }
    } else {
        info!("No bootstrap node provided. Starting a new network.");
    }

    let mut ticker = tokio::time::interval(config.refresh_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = node.refresh().await {
                    warn!("Routing table refresh failed: {}", e);
                }
                match serde_json::to_string(&node.metrics()) {
                    Ok(json) => info!("metrics {}", json),
                    Err(e) => error!("Failed to encode metrics: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                node.close().await;
                return Ok(());
            }
        }
    }
}
