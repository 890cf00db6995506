use anyhow::Result;
use clap::Parser;

use shellgate::app::{self, web_server::policy_manager};
use shellgate::{logging, Cli, Commands, ShellgateConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init(&cli)?;

    let config = ShellgateConfig::load(&cli)?;
    let policy = policy_manager(&config, cli.policy_file.as_deref())?;

    match cli.command() {
        Commands::Serve(args) => {
            if args.auto_approve && cli.policy_file.is_some() {
                tracing::warn!("--auto-approve is ignored when a policy file is given");
            }
            app::run_web_server(config, policy).await
        }
        Commands::Config => {
            println!("{}", app::print_config(&config, &policy)?);
            Ok(())
        }
        Commands::Classify { command, auto_approve } => {
            println!("{}", app::classify(&policy, &command, auto_approve)?);
            Ok(())
        }
    }
}
