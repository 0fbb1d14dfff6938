mod cli;
mod repl;

use anyhow::{bail, Context};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use repl::ChatRepl;
use vistachat::account::{Profile, ProfileFields};
use vistachat::app::{AppConfig, AppState};
use vistachat::chat::ChatSessionController;
use vistachat::platform::{AppPaths, SecureStorageManager};
use vistachat::server::Server;
use vistachat::transport::{HttpTransport, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Chat { endpoint: None });

    let paths = match &cli.data_dir {
        Some(root) => AppPaths::with_root(root),
        None => AppPaths::new()?,
    };
    paths.ensure_dirs_exist()?;

    let _log_guard = init_logging(&command, cli.debug, &paths)?;
    info!("Starting VistaChat {}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&paths).await?;
    let state = AppState::new(config, paths, SecureStorageManager::new()?);

    match command {
        Commands::Serve { port, bind } => serve(&state, port, bind).await?,
        Commands::Chat { endpoint } => chat(&state, endpoint).await?,
        Commands::Login { email, password } => {
            let session = state.sessions().login(&email, &password).await?;
            if let Some(user) = session.user {
                println!("Signed in as {} <{}>", user.name, user.email);
            }
        }
        Commands::Logout => {
            state.sessions().logout().await?;
            println!("Signed out");
        }
        Commands::Whoami => match state.sessions().get().await?.user {
            Some(user) => {
                println!("{} <{}>", user.name, user.email);
                if let Some(avatar) = user.avatar_url {
                    println!("Avatar: {}", avatar);
                }
            }
            None => println!("Not signed in"),
        },
        Commands::Profile { name } => {
            let user = Profile::new(state.sessions()).save(ProfileFields { name }).await?;
            println!("Profile saved: {} <{}>", user.name, user.email);
        }
        Commands::ApiKey { set, remove, status } => {
            let provider = state.get_config().model.provider;
            if let Some(key) = set {
                state.set_api_key(&key).await?;
                println!("API key stored for {}", provider);
            } else if remove {
                state.remove_api_key().await?;
                println!("API key removed for {}", provider);
            } else if status {
                match state.get_api_key().await? {
                    Some(_) => println!("{}: API key available", provider),
                    None => println!("{}: no API key", provider),
                }
            } else {
                bail!("Use --set <KEY>, --remove or --status");
            }
        }
    }

    Ok(())
}

/// Console output for every command; `serve` also keeps a daily log file.
fn init_logging(command: &Commands, debug: bool, paths: &AppPaths) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = match (debug, command) {
        (true, _) => "vistachat=debug",
        (false, Commands::Chat { .. }) => "vistachat=warn",
        (false, _) => "vistachat=info",
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    if !matches!(command, Commands::Serve { .. }) {
        tracing_subscriber::registry()
            .with(filter())
            .with(console)
            .try_init()
            .context("Failed to install logger")?;
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(paths.logs_dir(), "vistachat.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter())
        .with(console)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("Failed to install logger")?;
    Ok(Some(guard))
}

async fn serve(state: &AppState, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let mut config = state.get_config();
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }
    config.validate()?;

    let endpoint = state.create_endpoint().await?;
    let server = Server::bind(&config.bind_addr(), endpoint, config.server.max_body_bytes).await?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            on_signal.cancel();
        }
    });

    server.run(shutdown).await?;
    Ok(())
}

async fn chat(state: &AppState, endpoint: Option<String>) -> anyhow::Result<()> {
    let session = state.sessions().get().await?;
    let Some(user) = session.user.clone() else {
        bail!("Not signed in; run `vistachat login --email <EMAIL> --password <PASSWORD>` first");
    };

    let transport: Arc<dyn Transport> = match endpoint {
        Some(endpoint) => {
            let timeout = Duration::from_secs(state.get_config().client.connect_timeout_seconds);
            Arc::new(HttpTransport::new(endpoint, timeout)?)
        }
        None => Arc::new(state.create_transport()?),
    };

    let controller = ChatSessionController::for_session(&session, transport)?;
    ChatRepl::new(controller, user).run().await?;
    Ok(())
}
