//! HTTP control surface for the memory card.
//!
//! `/ramrom/*` reads and rewrites the 64 Ki cell map (data, attributes and
//! the video base); `/sd/*` manages the image directory and the drive
//! mounts. Handlers bridge onto the blocking controller mutex via
//! `spawn_blocking`; a mutex timeout surfaces as HTTP 500.

mod error;
mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use kimcard_machine::{Machine, MachineOptions};

pub use routes::AppState;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Holds `config.json` and the optional default-map image.
    pub data_dir: PathBuf,
    /// The image directory exposed under `/sd`.
    pub image_dir: PathBuf,
}

pub struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(());
        self.task.await??;
        Ok(())
    }
}

/// Bring up the machine and serve the control API on `bind_addr`.
pub async fn start(config: ServerConfig) -> anyhow::Result<RunningServer> {
    let options = MachineOptions::new(config.data_dir, config.image_dir);
    let machine = tokio::task::spawn_blocking(move || Machine::open(options)).await??;

    let app = routes::router(AppState {
        machine: Arc::new(machine),
    });
    let listener = TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    let (shutdown, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
    });

    info!(%addr, "control server listening");
    Ok(RunningServer {
        addr,
        shutdown,
        task,
    })
}
