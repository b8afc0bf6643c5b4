//! FsGate Server
//!
//! Sandboxed remote file management over a line protocol.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use server::config::Config;
use server::credentials::SqliteCredentialStore;
use server::files::{FileLimits, FileOperations};
use server::net::{ConnectionLimits, ConnectionListener};
use server::sandbox::{PathSandbox, ServerRoot};
use server::session::LoginRegistry;
use server::CommandDispatcher;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// FsGate - sandboxed remote file management server.
#[derive(Parser, Debug)]
#[command(name = "fsgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving connections
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Directory clients are confined to (overrides the config file)
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,
    },

    /// Manage user accounts
    #[command(subcommand)]
    Users(UsersCommands),
}

/// Subcommands for user management.
#[derive(Subcommand, Debug, Clone)]
pub enum UsersCommands {
    /// Add a user
    Add {
        /// Login name
        username: String,

        /// Password for the new user
        #[arg(long, short)]
        password: String,
    },

    /// Remove a user
    Remove {
        /// Login name
        username: String,
    },

    /// List all users
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    if let Commands::Serve { bind, root } = &cli.command {
        if let Some(bind) = bind {
            config.server.bind_addr = bind.clone();
        }
        if let Some(root) = root {
            config.server.root_dir = root.clone();
        }
    }

    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let _log_guard = init_tracing(level, config.server.log_file.as_deref())?;

    if let Some(path) = &cli.config {
        tracing::debug!(path = ?path, "Using config file");
    }

    match cli.command {
        Commands::Serve { .. } => run_server(config).await?,
        Commands::Users(command) => run_users(&config, command)?,
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
///
/// The returned guard must be held until exit so buffered file output is
/// flushed.
fn init_tracing(level: &str, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .with_context(|| format!("log_file has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Build the dispatcher and serve until SIGINT or SIGTERM.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let store = SqliteCredentialStore::open(&config.auth.database).with_context(|| {
        format!(
            "Failed to open user database: {}",
            config.auth.database.display()
        )
    })?;
    if store.list_users()?.is_empty() {
        tracing::warn!("No users configured; add one with `fsgate users add`");
    }

    let root = ServerRoot::new(&config.server.root_dir).with_context(|| {
        format!(
            "Failed to prepare server root: {}",
            config.server.root_dir.display()
        )
    })?;

    let files = FileOperations::new(PathSandbox::new(root), FileLimits::from(&config))
        .with_serialized_mutations(config.file.serialize_mutations);
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::new(store),
        LoginRegistry::new(config.auth.allow_concurrent_logins),
        files,
        config.protocol.delimiter,
    ));

    let listener = ConnectionListener::bind(
        config.server.bind_addr.as_str(),
        ConnectionLimits::from(&config),
    )
    .await
    .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        root = %dispatcher.files().sandbox().root().display(),
        delimiter = ?config.protocol.delimiter,
        "FsGate server started"
    );

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(listener.serve(dispatcher, shutdown.clone()));

    wait_for_shutdown_signal()
        .await
        .context("Failed to register signal handlers")?;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    server.await.context("Listener task failed")?;

    tracing::info!("FsGate server stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

fn run_users(config: &Config, command: UsersCommands) -> anyhow::Result<()> {
    let store = SqliteCredentialStore::open(&config.auth.database).with_context(|| {
        format!(
            "Failed to open user database: {}",
            config.auth.database.display()
        )
    })?;

    match command {
        UsersCommands::Add { username, password } => {
            store
                .add_user(&username, &password)
                .with_context(|| format!("Failed to add user {}", username))?;
            println!("Added user {}", username);
        }
        UsersCommands::Remove { username } => {
            if store.remove_user(&username)? {
                println!("Removed user {}", username);
            } else {
                anyhow::bail!("No such user: {}", username);
            }
        }
        UsersCommands::List => {
            let users = store.list_users()?;
            if users.is_empty() {
                println!("No users.");
                return Ok(());
            }
            println!("{:<24} CREATED", "USERNAME");
            for user in users {
                println!("{:<24} {}", user.username, user.created_at);
            }
        }
    }
    Ok(())
}
