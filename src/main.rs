// UTXO ledger - CLI

use clap::Parser;
use utxo_ledger::{Cli, CliHandler};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let handler = CliHandler::new(&cli);

    if let Err(e) = handler.handle(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
