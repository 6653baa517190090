use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;

mod chat;
mod config;
mod crm;
mod detect;
mod enrich;
mod format;
mod get;
mod post;
mod run;
mod state;
mod telemetry;
mod util;
mod versions;

#[derive(Parser)]
#[command(name = "relay", about = "CRM activity → team chat relay")]
struct Cli {
    /// Emit a single JSON envelope to stdout; logs go to stderr
    #[arg(global = true, long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run(run::RunCmd),
    Get(get::GetCmd),
    Versions(versions::VersionsCmd),
    Post(post::PostCmd),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    telemetry::config::set_json_mode(cli.json);

    // initialize logging/tracing (stderr). Respect RUST_LOG and RELAY_LOG_FORMAT
    telemetry::config::init_tracing();

    match cli.command {
        Commands::Run(args) => run::run(args).await?,
        Commands::Get(args) => get::run(args).await?,
        Commands::Versions(args) => versions::run(args).await?,
        Commands::Post(args) => post::run(args).await?,
    }

    Ok(())
}
