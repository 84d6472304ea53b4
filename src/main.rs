//! pty-warden - supervisor that keeps pty sessions alive across client restarts.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pty_warden::client::{SessionEvent, SupervisorClient};
use pty_warden::config::WardenConfig;
use pty_warden::server::Supervisor;
use pty_warden::transport::{self, Connection};

#[derive(Parser)]
#[command(
    name = "pty-warden",
    about = "Supervisor that keeps pty sessions alive across client restarts",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor.
    Serve {
        /// Socket path to listen on.
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Pre-opened listening socket inherited from the parent.
        #[arg(long, hide = true)]
        listen_fd: Option<RawFd>,
        /// Read half of a pre-accepted client connection.
        #[arg(long, hide = true, requires = "write_fd")]
        read_fd: Option<RawFd>,
        /// Write half of a pre-accepted client connection.
        #[arg(long, hide = true, requires = "read_fd")]
        write_fd: Option<RawFd>,
    },
    /// Attach to a running supervisor and list its children.
    Status {
        /// Socket path to connect to.
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

fn init_tracing(verbosity: u8, fallback: Option<&str>) {
    let level = match verbosity {
        0 => fallback.unwrap_or("warn"),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match WardenConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.verbose, config.log_filter.as_deref());

    match cli.command {
        Commands::Serve {
            socket,
            listen_fd,
            read_fd,
            write_fd,
        } => run_serve(&config, socket, listen_fd, read_fd, write_fd),
        Commands::Status { socket } => run_status(&config, socket).await,
    }
}

/// Runs the supervisor until its event loop fails. This never exits
/// successfully; a supervisor with no reason to exist is killed, not asked
/// to leave.
fn run_serve(
    config: &WardenConfig,
    socket: Option<PathBuf>,
    listen_fd: Option<RawFd>,
    read_fd: Option<RawFd>,
    write_fd: Option<RawFd>,
) -> ExitCode {
    let path = config.resolve_socket_path(socket.as_deref());

    let supervisor = if let Some(fd) = listen_fd {
        Supervisor::with_listener(&path, transport::adopt_raw(fd))
    } else {
        remove_stale_socket(&path);
        Supervisor::bind(&path)
    };
    let supervisor = match supervisor {
        Ok(supervisor) => supervisor,
        Err(err) => {
            tracing::error!(%err, "supervisor setup failed");
            let _ = std::fs::remove_file(&path);
            return ExitCode::FAILURE;
        }
    };

    let initial = match (read_fd, write_fd) {
        (Some(read), Some(write)) => Some(Connection::from_split(
            transport::adopt_raw(read),
            transport::adopt_raw(write),
        )),
        _ => None,
    };

    let err = supervisor.run(initial);
    tracing::error!(%err, "supervisor loop failed");
    let _ = std::fs::remove_file(&path);
    ExitCode::FAILURE
}

fn remove_stale_socket(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "removed stale socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), %err, "could not remove stale socket"),
    }
}

async fn run_status(config: &WardenConfig, socket: Option<PathBuf>) -> ExitCode {
    let path = config.resolve_socket_path(socket.as_deref());

    let (client, mut events) = match SupervisorClient::attach(&path).await {
        Ok(attached) => attached,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    println!("supervisor pid {} at {}", client.server_pid(), path.display());
    println!("{} children", client.child_count());

    let mut remaining = client.child_count();
    while remaining > 0 {
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv()).await;
        match event {
            Ok(Some(SessionEvent::Discovered(child))) => {
                let state = if child.terminated { "terminated" } else { "running" };
                println!(
                    "  pid {} {} on {} ({})",
                    child.pid, state, child.tty_path, child.spec.path
                );
                remaining -= 1;
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                eprintln!("error: replay ended early");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
