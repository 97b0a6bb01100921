use anyhow::Context;
use clap::Parser;
use photosync::cli::Cli;
use photosync::config::AppConfig;
use photosync::logging::init_logging;
use photosync::manager::Manager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.logging())?;

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let outcomes = Manager::new(config)
        .run(cli.identity.as_deref(), &cli.action())
        .await?;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(output) => println!("[{}]\n{output}", outcome.identity),
            Err(err) => {
                failed += 1;
                eprintln!("[{}] error: {err:#}", outcome.identity);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} identities failed", outcomes.len());
    }
    Ok(())
}
