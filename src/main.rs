use clap::Parser;
use tracing_subscriber::EnvFilter;

use agentlink::cli::{handlers, Cli, Commands};
use agentlink::{Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the agent's output
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("agentlink=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server.base_url = server;
    }

    match cli.command {
        Commands::Send { session_id, message } => {
            handlers::send_message(config, session_id, message.join(" ")).await
        }
        Commands::Attach { session_id } => handlers::attach_session(config, session_id).await,
        Commands::Abort { session_id } => handlers::abort_session(config, session_id).await,
        Commands::Disconnect { session_id } => handlers::disconnect_session(config, session_id).await,
        Commands::Messages { session_id } => handlers::show_messages(config, session_id).await,
        Commands::Sessions => handlers::list_sessions(config).await,
        Commands::SetCwd { session_id, cwd } => handlers::set_cwd(config, session_id, cwd).await,
        Commands::Watch => handlers::watch_agents(config).await,
        Commands::Login { token } => handlers::login(config, token).await,
        Commands::Status => handlers::show_status(config).await,
    }
}
