//! Single-threaded readiness runtime for the proxy.
//!
//! - `event_loop`: the mio poll loop, acceptor and teardown
//! - `connection`: client connections and the registry that owns them
//! - `bridge`: request/response turns against the device link
//! - `shutdown`: waking the loop from another thread or a signal

mod bridge;
mod connection;
mod event_loop;
mod shutdown;

pub use event_loop::{Flow, Proxy};
pub use shutdown::{watch_signals, ShutdownHandle};

use tracing::{error, info};

use crate::config::Config;
use crate::device::{DeviceLink, EchoDevice, TcpDevice};
use crate::error::Result;

/// Run the proxy with the device selected by `config`.
pub fn run(config: Config) -> Result<()> {
    if config.echo {
        info!("Echo mode: replies are the requests themselves");
        serve(&config, EchoDevice::new())
    } else {
        let device = TcpDevice::connect(config.device_addr()?)?;
        serve(&config, device)
    }
}

fn serve<D: DeviceLink>(config: &Config, device: D) -> Result<()> {
    let mut proxy = Proxy::bind(config, device)?;
    watch_signals(proxy.shutdown_handle())?;

    info!("To quit, press Ctrl+C");
    let result = proxy.run();
    drop(proxy);
    info!("Connections closed");

    if let Err(ref e) = result {
        if e.is_device() {
            error!("Device link lost; restart the proxy once the instrument is reachable");
        }
    }
    result
}
