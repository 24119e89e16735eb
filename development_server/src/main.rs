use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Scripted HTTP server for client fault injection", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Port to bind, 0 picks a free one
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    env_logger::init();

    if let Err(e) = try_main().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn try_main() -> anyhow::Result<()> {
    let args = Args::parse();
    let server = development_server::start(
        development_server::default_router(),
        SocketAddr::new(args.ip, args.port),
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await;
    Ok(())
}
