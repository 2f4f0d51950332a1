use anyhow::Context;
use microgate::{config::GatewayConfig, init_gateway, observability::init_tracing};
use std::env;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = PathBuf::from(
        env::args()
            .nth(1)
            .unwrap_or_else(|| "config/gateway.yaml".to_string()),
    );

    let config = GatewayConfig::from_file(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {} (usage: microgate [config_file])",
            config_path.display()
        )
    })?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging)?;

    init_gateway(config, Some(config_path))
        .await
        .context("Gateway error")?;

    Ok(())
}
