use anyhow::Result;
use clap::Parser;
use prescan::args::PrefilterArgs;
use prescan::prefilter::{validate_config, Prefiltering};

#[derive(Parser)]
#[command(name = "prescan")]
#[command(version = "0.1.0")]
#[command(about = "k-mer prefiltering for sequence similarity search", long_about = None)]
struct Cli {
    #[command(flatten)]
    args: PrefilterArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.args.to_config();
    validate_config(&config)?;

    let mut prefiltering = Prefiltering::new(config)?;
    match (cli.args.shard_rank, cli.args.shard_count) {
        (Some(rank), Some(world_size)) => prefiltering.run_sharded(rank, world_size)?,
        _ => prefiltering.run()?,
    }
    Ok(())
}
