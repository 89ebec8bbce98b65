//! TURN probe: exercises allocate, permission, Send indications and channel
//! binding against a real TURN server, or runs as a plain UDP echo responder.
//!
//! ```text
//! turn-probe --server turn.example.org:3478 --username u --password p --peer 192.0.2.7:3333
//! turn-probe --peer 0.0.0.0:3333 peer   # echo responder
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use firn::socket::{SocketEvents, TurnConfig, TurnSocket};
use firn::stun::Message;
use firn::SockMode;

#[derive(Parser, Debug)]
#[command(name = "turn-probe", about = "TURN client round-trip probe")]
struct Args {
    /// TURN server address.
    #[arg(long)]
    server: Option<SocketAddr>,

    /// Peer to relay to (or, in peer mode, the port to echo on).
    #[arg(long)]
    peer: SocketAddr,

    #[arg(long, default_value = "")]
    username: String,

    #[arg(long, default_value = "")]
    password: String,

    /// Pass `peer` to run as a plain UDP echo responder instead.
    mode: Option<String>,
}

struct DataSink {
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl SocketEvents for DataSink {
    fn stun_message_received(&self, _local: SocketAddr, from: SocketAddr, message: Message) {
        tracing::debug!(%from, %message, "Unexpected STUN message");
    }

    fn data_received(&self, _local: SocketAddr, peer: SocketAddr, data: Vec<u8>) {
        let _ = self.tx.send((peer, data));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    if args.mode.as_deref() == Some("peer") {
        return echo_responder(args.peer.port()).await;
    }

    let Some(server) = args.server else {
        bail!("--server is required unless running in peer mode");
    };
    if args.password.is_empty() {
        bail!("no password set, auth is required");
    }

    let turn = TurnSocket::bind(
        "0.0.0.0:0".parse().expect("valid bind address"),
        TurnConfig {
            server,
            username: args.username.clone(),
            password: args.password.clone(),
        },
    )
    .await
    .context("failed to bind")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn firn::socket::SocketEvents> = Arc::new(DataSink { tx });
    turn.set_callback(Arc::downgrade(&sink));

    let relayed = turn.allocate().await.context("allocation failed")?;
    tracing::info!(%relayed, mapped = ?turn.mapped_addr(), "Allocation ready");

    turn.create_permission(&[args.peer])
        .await
        .context("create-permission failed")?;

    // Round one: a Send indication, echoed back as a Data indication.
    let payload = b"Hello world!".to_vec();
    turn.send(relayed, args.peer, &payload)
        .await
        .context("send indication failed")?;
    let (from, echoed) = recv_payload(&mut rx).await.context("no echo via indication")?;
    if from != args.peer || echoed != payload {
        bail!("indication echo mismatch: {} bytes from {from}", echoed.len());
    }
    tracing::info!("Send/Data indication round-trip ok");

    // Round two: bind a channel and go through ChannelData framing.
    let channel = turn.channel_bind(args.peer).await.context("channel bind failed")?;
    tracing::info!(channel, "Channel bound");
    turn.finish_negotiation(SockMode::TurnData);

    let payload = b"Hello world, channel!".to_vec();
    turn.send(relayed, args.peer, &payload)
        .await
        .context("channel send failed")?;
    let (from, echoed) = recv_payload(&mut rx).await.context("no echo via channel")?;
    if from != args.peer || echoed != payload {
        bail!("channel echo mismatch: {} bytes from {from}", echoed.len());
    }
    tracing::info!("ChannelData round-trip ok");

    turn.close().await;
    tracing::info!("Done");

    Ok(())
}

async fn recv_payload(
    rx: &mut mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
) -> Result<(SocketAddr, Vec<u8>)> {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .context("timed out waiting for echo")?
        .context("socket closed")
}

async fn echo_responder(port: u16) -> Result<()> {
    let socket = tokio::net::UdpSocket::bind(("0.0.0.0", port))
        .await
        .context("failed to bind echo port")?;
    tracing::info!(addr = %socket.local_addr()?, "Echoing datagrams");

    let mut buf = [0u8; 65536];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        tracing::info!(%from, len, "Echoing");
        socket.send_to(&buf[..len], from).await?;
    }
}
