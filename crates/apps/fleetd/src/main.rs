//! fleetd — run one fleet service from the shared config file.
//!
//! Hosts the named service's RPC endpoint with the built-in `ping` method,
//! until SIGINT. Domain services embed `fleet_rpc::Service` directly and
//! register their own methods; this binary is the bare host used for
//! liveness probing and as deployment scaffolding.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use fleet_config::ServiceDirectory;
use fleet_rpc::{MethodRegistry, Service};

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
struct Args {
    /// Service directory config file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Logical service name to host.
    #[arg(long)]
    service: String,
    /// Shard of the service.
    #[arg(long, default_value_t = 0)]
    shard: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let directory = match ServiceDirectory::load(&args.config) {
        Ok(directory) => Arc::new(directory),
        Err(err) => {
            eprintln!("fleetd: cannot load {}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let service = match Service::new(
        args.service.as_str(),
        args.shard,
        directory,
        MethodRegistry::new(),
    ) {
        Ok(service) => Arc::new(service),
        Err(err) => {
            eprintln!("fleetd: cannot start {}:{}: {err}", args.service, args.shard);
            return ExitCode::FAILURE;
        }
    };

    {
        let service = service.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("fleetd: interrupt received, shutting down");
                service.shutdown();
            }
        });
    }

    match service.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fleetd: {err}");
            ExitCode::FAILURE
        }
    }
}
