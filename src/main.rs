//! ips-proxy server binary.
//!
//! Configuration via CLI arguments or TOML file.

use ips_proxy::config::Config;
use ips_proxy::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        device = %config.device,
        echo = config.echo,
        buffer_size = config.buffer_size,
        settle_delay_ms = config.settle_delay.as_millis() as u64,
        "Starting ips-proxy"
    );

    runtime::run(config)?;
    Ok(())
}
