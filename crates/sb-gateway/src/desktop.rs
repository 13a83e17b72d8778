use crate::error::GatewayError;
use axum::extract::State;
use axum::Json;
use sb_config::DesktopConfig;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

const PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const PROVISION_ATTEMPTS: u32 = 20;
const PROVISION_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct DesktopStatus {
    pub running: bool,
    pub message: String,
}

/// Best-effort bootstrap of the remote-desktop stack: a display server and
/// a framebuffer exporter. The tunnel only dials them, it never manages
/// their lifecycle beyond this start/health-check.
pub struct DesktopSupervisor {
    config: DesktopConfig,
    children: tokio::sync::Mutex<Vec<Child>>,
}

impl DesktopSupervisor {
    pub fn new(config: DesktopConfig) -> Self {
        Self {
            config,
            children: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn vnc_port(&self) -> u16 {
        self.config.vnc_port
    }

    pub async fn status(&self) -> DesktopStatus {
        if probe_port(self.config.vnc_port).await {
            DesktopStatus {
                running: true,
                message: format!("display server accepting on port {}", self.config.vnc_port),
            }
        } else {
            DesktopStatus {
                running: false,
                message: "display server not running".to_string(),
            }
        }
    }

    /// Probe the port; when absent, launch the display server and
    /// framebuffer exporter and poll a bounded number of attempts.
    pub async fn provision(&self) -> Result<DesktopStatus, GatewayError> {
        if probe_port(self.config.vnc_port).await {
            return Ok(DesktopStatus {
                running: true,
                message: "already running".to_string(),
            });
        }

        tracing::info!(
            display = %self.config.display,
            port = self.config.vnc_port,
            "provisioning remote-desktop stack"
        );

        let xvfb = Command::new("Xvfb")
            .arg(&self.config.display)
            .arg("-screen")
            .arg("0")
            .arg(&self.config.geometry)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::SpawnFailure(format!("Xvfb: {e}")))?;

        let x11vnc = Command::new("x11vnc")
            .arg("-display")
            .arg(&self.config.display)
            .arg("-rfbport")
            .arg(self.config.vnc_port.to_string())
            .arg("-forever")
            .arg("-shared")
            .arg("-nopw")
            .arg("-quiet")
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::SpawnFailure(format!("x11vnc: {e}")))?;

        {
            let mut children = self.children.lock().await;
            children.push(xvfb);
            children.push(x11vnc);
        }

        for attempt in 0..PROVISION_ATTEMPTS {
            if probe_port(self.config.vnc_port).await {
                return Ok(DesktopStatus {
                    running: true,
                    message: format!("started after {} attempt(s)", attempt + 1),
                });
            }
            tokio::time::sleep(PROVISION_POLL).await;
        }

        Ok(DesktopStatus {
            running: false,
            message: format!(
                "port {} did not accept connections after {} attempts",
                self.config.vnc_port, PROVISION_ATTEMPTS
            ),
        })
    }

    pub async fn shutdown(&self) {
        let mut children = self.children.lock().await;
        for child in children.iter_mut() {
            let _ = child.kill().await;
        }
        children.clear();
    }
}

pub async fn probe_port(port: u16) -> bool {
    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

pub async fn desktop_status(State(state): State<crate::state::AppState>) -> Json<DesktopStatus> {
    Json(state.desktop.status().await)
}

pub async fn desktop_provision(
    State(state): State<crate::state::AppState>,
) -> Result<Json<DesktopStatus>, crate::error::ApiErrorResponse> {
    match state.desktop.provision().await {
        Ok(status) => Ok(Json(status)),
        Err(err) => Err(crate::error::ApiErrorResponse {
            status: axum::http::StatusCode::BAD_GATEWAY,
            error: crate::error::ApiError::new(err.code(), err.to_string()),
        }),
    }
}
