use anyhow::Result;
use rustlite_probe::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    rustlite_probe::init_tracing();
    let failed = rustlite_probe::run(cli).await?;
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
