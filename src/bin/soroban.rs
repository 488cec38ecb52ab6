use clap::Parser;
use soroban_p2p::cli::Cli;
use soroban_p2p::logging::init_tracing;
use soroban_p2p::server;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[tokio::main]
async fn main() {
    let options = match Cli::parse().into_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Invalid options: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = init_tracing(&options.log_level, &options.log_file) {
        eprintln!("Failed to set up logging: {e}");
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    server::cancel_on_signal(cancel.clone());
    if let Err(e) = server::run(&options, cancel).await {
        error!("Soroban node failed: {e}");
        std::process::exit(1);
    }
}
