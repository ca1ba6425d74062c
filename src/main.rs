use anyhow::Result;
use env_logger::{Env, Target};

use rtu_exerciser::cli::{build_cli, handle_commands};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stdout)
        .init();

    let cli = build_cli();
    let matches = cli.clone().get_matches();

    handle_commands(cli, &matches).await
}
