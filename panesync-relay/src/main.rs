use std::process::ExitCode;

use clap::Parser;
use panesync_relay::{AppState, serve};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "panesync-relay", about = "Routes window events for panesync sessions")]
struct RelayArgs {
    /// Windows of one desktop app normally share a loopback relay.
    #[arg(long, default_value = "127.0.0.1:7878")]
    bind_address: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_address = %args.bind_address, "failed to bind: {}", err);
            return ExitCode::FAILURE;
        }
    };

    info!(bind_address = %args.bind_address, "relay starting");
    match serve(listener, AppState::new()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("relay server exited: {}", err);
            ExitCode::FAILURE
        }
    }
}
