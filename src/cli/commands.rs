use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "agentlink")]
#[command(about = "Resumable streaming client for remote agent sessions", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Backend URL (overrides config and AGENTLINK_SERVER)
    #[arg(long, global = true)]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a message and stream the agent's response
    Send {
        /// Session ID
        session_id: String,
        /// Message text
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Reattach to a response that is still running
    Attach {
        /// Session ID to attach to
        session_id: String,
    },
    /// Stop the agent running in a session
    Abort {
        /// Session ID
        session_id: String,
    },
    /// Release a session's execution context on the backend
    Disconnect {
        /// Session ID
        session_id: String,
    },
    /// Print a session's messages
    Messages {
        /// Session ID
        session_id: String,
    },
    /// List all sessions
    Sessions,
    /// Change a session's working directory
    SetCwd {
        /// Session ID
        session_id: String,
        /// New working directory
        cwd: String,
    },
    /// Follow which agents are running across all sessions
    Watch,
    /// Store a bearer token for a remote backend
    Login {
        /// Token issued by the backend
        #[arg(long)]
        token: String,
    },
    /// Show backend reachability and active agents
    Status,
}
