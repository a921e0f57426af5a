mod cli;
mod commands;
mod executor;

use clap::Parser;
use cli::{Cli, Commands, SessionAction};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries command results; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Investigate { target, issue, json } => {
            commands::investigate::run(config, &target, &issue, json).await
        }
        Commands::Exec { session, command } => commands::exec::run(config, &session, &command).await,
        Commands::Ask { session, question, k } => commands::ask::run(config, &session, &question, k).await,
        Commands::Resume { session } => commands::resume::run(config, &session).await,
        Commands::Sessions { action } => match action {
            Some(SessionAction::List) | None => commands::sessions::run_list(config),
            Some(SessionAction::Show { id }) => commands::sessions::run_show(config, &id),
            Some(SessionAction::Cleanup { days, keep }) => commands::sessions::run_cleanup(config, days, keep),
        },
        Commands::Version => commands::version::run(),
    }
}
