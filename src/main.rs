use clap::Parser;
use pode::cli::{Cli, Commands};

fn main() {
    pode::server::init_tracing();
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Start(args) => pode::cli::start(args),
        Commands::Init(args) => pode::cli::init(args),
    };
    std::process::exit(code);
}
