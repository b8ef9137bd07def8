//! tierdb admin entry point.

use anyhow::Context;
use tierdb_lib::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    let command = format!("{:?}", cli.command);

    cli::execute(cli)
        .await
        .with_context(|| format!("tierdb command failed: {command}"))
}
