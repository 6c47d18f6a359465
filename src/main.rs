use anyhow::Context;
use clap::Parser;
use tokio::net::TcpStream;

use relay_chat::message::PeerEndpoint;
use relay_chat::terminal::Client;

/// Client for a relayed peer-to-peer chat service.
#[derive(Debug, Parser)]
#[command(name = "relay-chat", version)]
struct Args {
    /// The host:port of the rendezvous server.
    address: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let stream = TcpStream::connect(&args.address)
        .await
        .with_context(|| format!("connecting to server {}", args.address))?;
    let local = stream.local_addr().context("reading local socket address")?;
    log::info!("connected to {} from {local}", args.address);
    println!("Connected to {}. Commands: connect [<ip>] <port>, listsocks", args.address);

    let local = PeerEndpoint::new(local.ip().to_string(), local.port().to_string());
    Client::new(stream, local).run().await?;
    Ok(())
}
