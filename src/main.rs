// herm_dpo - DPO implicit-reward evaluation runner

use anyhow::Result;
use clap::Parser;
use herm_dpo::cli::{run, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(&cli)
}
