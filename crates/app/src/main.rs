mod resolve;
mod telemetry;

use std::env;

use tracing::{info, warn};

use store_directory_storage::{Database, DEFAULT_MAX_CONNECTIONS};
use store_directory_util::{load_env_file, AppConfig};

use crate::resolve::StoreResolver;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;

    let max_connections = config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
    let database =
        Database::connect_with_max_connections(&config.database_url, max_connections).await?;
    database.run_migrations().await?;
    info!(stage = "app", env = %config.environment.as_str(), max_connections, "store directory ready");

    let hosts: Vec<String> = env::args().skip(1).collect();
    if hosts.is_empty() {
        warn!(stage = "app", "no host names given; usage: store-directory <host>...");
        return Ok(());
    }

    let resolver = StoreResolver::new(&database);
    for host in &hosts {
        let resolution = resolver.resolve(host).await?;
        println!("{}", serde_json::to_string(&resolution)?);
    }

    Ok(())
}
