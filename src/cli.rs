use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vistachat")]
#[command(about = "Chat with a language model using text and image attachments")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Keep config, session and logs under this directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the completion endpoint
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Start the interactive chat
    Chat {
        /// Completion endpoint URL (overrides config)
        #[arg(short, long)]
        endpoint: Option<String>,
    },

    /// Sign in
    Login {
        #[arg(short, long)]
        email: String,

        #[arg(short, long)]
        password: String,
    },

    /// Sign out
    Logout,

    /// Show who is signed in
    Whoami,

    /// Edit the signed-in user's profile
    Profile {
        /// New display name
        #[arg(short, long)]
        name: String,
    },

    /// Manage the model provider API key
    ApiKey {
        /// Store an API key
        #[arg(short, long)]
        set: Option<String>,

        /// Remove the stored API key
        #[arg(short, long)]
        remove: bool,

        /// Show whether a key is available
        #[arg(long)]
        status: bool,
    },
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            command: Some(Commands::Chat { endpoint: None }),
            data_dir: None,
            debug: false,
        }
    }
}
