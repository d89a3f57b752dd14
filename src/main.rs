use clap::Parser;
use std::process::ExitCode;
use sybil_gateway::{logging, Config};

fn main() -> ExitCode {
    let config = Config::parse();
    let _guard = logging::init(config.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("failed to start tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(sybil_gateway::run(config)) {
        Ok(()) => {
            tracing::info!("gateway stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("gateway failed: {err}");
            ExitCode::FAILURE
        }
    }
}
