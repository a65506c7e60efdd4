use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kimcard_control_server::{start, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "kimcard-control-server", about = "HTTP control plane for the KIM-1 memory card")]
struct Args {
    /// Address to serve the control API on.
    #[arg(long, env = "KIMCARD_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Directory holding config.json and the default memory map.
    #[arg(long, env = "KIMCARD_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Directory of IMD images exposed under /sd.
    #[arg(long, env = "KIMCARD_IMAGE_DIR", default_value = "./images")]
    image_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir)?;
    std::fs::create_dir_all(&args.image_dir)?;

    let server = start(ServerConfig {
        bind_addr: args.bind,
        data_dir: args.data_dir,
        image_dir: args.image_dir,
    })
    .await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await
}
