use clap::{Parser, Subcommand};
use sb_config::{ConfigPaths, DaemonConfig};
use sb_gateway::rest::health::init_start_time;
use sb_gateway::{build_router, AppState};
use std::net::SocketAddr;
use switchboardd::{
    is_process_alive, pid_looks_like_daemon, read_pid_file, remove_pid_file, write_pid_file,
};

#[derive(Parser)]
#[command(
    name = "switchboardd",
    version = switchboardd::DAEMON_VERSION,
    about = "Switchboard gateway daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the background
    Start {
        /// Port to bind to
        #[arg(long, default_value_t = 7870)]
        port: u16,
    },
    /// Run the daemon in the foreground
    Run {
        /// Port to bind to
        #[arg(long, default_value_t = 7870)]
        port: u16,
    },
    /// Check daemon status
    Status,
    /// Stop a running daemon
    Stop,
    /// Generate a new shared secret
    Secret,
    /// Print version
    Version,
}

fn check_not_running(paths: &ConfigPaths) -> anyhow::Result<()> {
    if let Some(pid) = read_pid_file(&paths.pid_path()) {
        if is_process_alive(pid) {
            if pid_looks_like_daemon(pid) {
                anyhow::bail!(
                    "Daemon already running (PID {}). Use 'switchboardd stop' first.",
                    pid
                );
            }
            tracing::warn!(
                "PID file points to live non-switchboardd process {}, cleaning up.",
                pid
            );
        } else {
            tracing::warn!("Removing stale PID file for dead process {}", pid);
        }
        remove_pid_file(&paths.pid_path());
    }
    Ok(())
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> anyhow::Result<()> {
    let raw_pid = i32::try_from(pid).map_err(|_| anyhow::anyhow!("PID out of range: {}", pid))?;
    // Safety: `raw_pid` is validated as a positive process id for libc::kill.
    let rc = unsafe { libc::kill(raw_pid, signal) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboardd=info,sb_gateway=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let paths = ConfigPaths::new()?;

    match cli.command {
        Commands::Start { port } => {
            check_not_running(&paths)?;
            paths.ensure_config_dir()?;
            let config = DaemonConfig::load()?;

            let exe = std::env::current_exe()?;
            let out_log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(paths.config_dir().join("switchboardd.out.log"))?;
            let err_log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(paths.config_dir().join("switchboardd.err.log"))?;

            std::process::Command::new(&exe)
                .arg("run")
                .arg("--port")
                .arg(port.to_string())
                .stdin(std::process::Stdio::null())
                .stdout(out_log)
                .stderr(err_log)
                .spawn()?;

            println!("Switchboard daemon started.");
            println!();
            println!("  API: http://{}:{}", config.host, port);
            println!();
            Ok(())
        }

        Commands::Run { port } => {
            check_not_running(&paths)?;
            paths.ensure_config_dir()?;

            let mut config = DaemonConfig::load()?;
            config.port = port;
            write_pid_file(&paths.pid_path())?;

            if config.auth_secret.is_none() {
                tracing::warn!("No shared secret configured; access control is disabled");
            }

            init_start_time();

            let state = AppState::new(config.clone())?;
            let shutdown_state = state.clone();
            let shutdown_paths = paths.clone();
            let app = build_router(state);

            let addr: SocketAddr = config.bind_addr().parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("Listening on {}", addr);

            let shutdown = async move {
                #[cfg(unix)]
                {
                    let mut terminate =
                        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                            .expect("Failed to install SIGTERM handler");
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                #[cfg(not(unix))]
                {
                    tokio::signal::ctrl_c()
                        .await
                        .expect("Failed to listen for ctrl+c");
                }
                tracing::info!("Shutting down...");
                shutdown_state.shutdown().await;
                remove_pid_file(&shutdown_paths.pid_path());
            };

            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await?;

            Ok(())
        }

        Commands::Status => {
            match read_pid_file(&paths.pid_path()) {
                Some(pid) if is_process_alive(pid) && pid_looks_like_daemon(pid) => {
                    println!("Daemon is running (PID {})", pid);
                    let config = DaemonConfig::load()?;
                    match reqwest::get(format!("http://{}/healthz", config.bind_addr())).await {
                        Ok(resp) => {
                            let body: serde_json::Value = resp.json().await?;
                            println!("Version: {}", body["version"].as_str().unwrap_or("unknown"));
                            println!("Uptime: {}s", body["uptime_secs"].as_u64().unwrap_or(0));
                            println!(
                                "Connections: {}",
                                body["connections"].as_u64().unwrap_or(0)
                            );
                        }
                        Err(_) => {
                            println!("(Could not reach health endpoint)");
                        }
                    }
                }
                Some(pid) if is_process_alive(pid) => {
                    println!(
                        "PID file points to non-switchboardd process {}. Cleaning stale PID file.",
                        pid
                    );
                    remove_pid_file(&paths.pid_path());
                }
                Some(pid) => {
                    println!("Daemon is not running (stale PID {})", pid);
                    remove_pid_file(&paths.pid_path());
                }
                None => {
                    println!("Daemon is not running");
                }
            }
            Ok(())
        }

        Commands::Stop => {
            match read_pid_file(&paths.pid_path()) {
                Some(pid) if is_process_alive(pid) && pid_looks_like_daemon(pid) => {
                    println!("Stopping daemon (PID {})...", pid);
                    #[cfg(unix)]
                    send_signal(pid, libc::SIGTERM)?;
                    for _ in 0..50 {
                        if !is_process_alive(pid) {
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                    if is_process_alive(pid) {
                        println!("Force killing...");
                        #[cfg(unix)]
                        send_signal(pid, libc::SIGKILL)?;
                    }
                    remove_pid_file(&paths.pid_path());
                    println!("Daemon stopped.");
                }
                Some(pid) if is_process_alive(pid) => {
                    println!(
                        "Refusing to stop PID {} because it is not switchboardd. Cleaning stale PID file.",
                        pid
                    );
                    remove_pid_file(&paths.pid_path());
                }
                Some(pid) => {
                    println!("Daemon not running (stale PID {}), cleaning up.", pid);
                    remove_pid_file(&paths.pid_path());
                }
                None => {
                    println!("Daemon is not running.");
                }
            }
            Ok(())
        }

        Commands::Secret => {
            paths.ensure_config_dir()?;
            let secret = sb_gateway::auth::generate_secret();
            std::fs::write(paths.secret_path(), &secret)?;
            println!("{}", secret);
            if let Some(pid) = read_pid_file(&paths.pid_path()) {
                if is_process_alive(pid) {
                    println!("\nNote: restart the daemon for the new secret to take effect.");
                }
            }
            Ok(())
        }

        Commands::Version => {
            println!("switchboardd {}", switchboardd::DAEMON_VERSION);
            Ok(())
        }
    }
}
