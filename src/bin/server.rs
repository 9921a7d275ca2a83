//! `kvbus-server` binary entry point.
//!
//! Parses startup flags into a [`kvbus::config::Config`], binds a listener,
//! and runs until SIGINT or SIGTERM.

use kvbus::{config::Config, server};
use tokio::net::TcpListener;

#[tokio::main]
pub async fn main() -> kvbus::Result<()> {
    tracing_subscriber::fmt::try_init()?;

    let config = Config::from_args();
    let listener = TcpListener::bind(config.addr()).await?;

    tracing::info!(addr = %config.addr(), "listening");

    server::run(listener, config, server::shutdown_signal()).await
}
