//! Overlord server binary: the agent broker and operator endpoint.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use overlord::constants::{DEFAULT_OPERATOR_PORT, DEFAULT_SERVER_PORT};
use overlord::server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "overlord-server", about = "Overlord session broker", version)]
struct Args {
    /// Bind address for both listeners.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port agents connect to (`/connect`).
    #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Port for the operator endpoint.
    #[arg(long = "operator-port", default_value_t = DEFAULT_OPERATOR_PORT)]
    operator_port: u16,

    /// Seconds a spawned session may take to connect before its pending
    /// entry is evicted.
    #[arg(long = "session-timeout", default_value_t = 30)]
    session_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig {
        bind: args.bind,
        port: args.port,
        operator_port: args.operator_port,
        session_grace: Duration::from_secs(args.session_timeout),
    };
    let server = Server::bind(&config).await?;

    tokio::select! {
        result = server.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            log::error!("received interrupt, quit");
            Ok(())
        }
    }
}
