use clap::Parser;
use ctxpack_cli::{Cli, init_logging};

fn main() {
    init_logging();
    let cli = Cli::parse();
    std::process::exit(cli.run());
}
