//! A demo gRPC server that echoes requests back over native gRPC and gRPC-Web.

#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use minigrpc_app::prelude::*;
use minigrpc_config::ConfigurationLoader;
use minigrpc_error::{ErrorContext as _, GenericError};
use minigrpc_server::{MinimalGrpcServer, ServerSettings};
use tracing::{error, info};

mod cli;
use self::cli::Cli;

mod echo;
use self::echo::EchoService;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging("minigrpc-demo", None) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    if let Err(e) = initialize_tls() {
        fatal_and_exit(format!("failed to initialize TLS: {}", e));
    }

    match run(cli).await {
        Ok(()) => info!("minigrpc-demo stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    let settings: ServerSettings = ConfigurationLoader::default()
        .try_from_yaml(&cli.config)
        .from_environment("MINIGRPC")?
        .into_typed()
        .error_context("Failed to load server settings.")?;

    info!(
        listen_addr = %settings.listen_address,
        grace_period_secs = settings.stop_grace_period_secs,
        "minigrpc-demo starting..."
    );

    let config = settings
        .into_builder()?
        .with_registration(|registry| {
            registry.add_service(EchoService);
        })
        .build();

    MinimalGrpcServer::from_config(config).run_until_interrupted().await
}
