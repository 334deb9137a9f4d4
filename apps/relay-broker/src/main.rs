use clap::Parser;
use relay_broker::app;
use relay_broker::cli::{Cli, Command};
use relay_broker::config::BrokerConfig;
use relay_broker::telemetry::init_tracing;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let result = match cli.command {
        Command::Serve(args) => match BrokerConfig::try_from(args) {
            Ok(config) => app::serve(config).await,
            Err(err) => Err(err),
        },
        Command::Announce(args) => app::announce(args).await,
    };

    if let Err(err) = result {
        error!("relay-broker failed: {err:#}");
        std::process::exit(1);
    }
}
