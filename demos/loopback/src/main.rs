//! Loopback demo
//!
//! Two connections talk over a real TCP socket on 127.0.0.1:
//! - The **server** accepts `session` channels, answers `exec` requests and
//!   echoes channel data back.
//! - The **client** sends a keepalive, opens a session, runs a command and
//!   reads the echo.
//!
//! Run with `RUST_LOG=sshconn_core=debug` to watch the message flow.

use bytes::Bytes;
use sshconn_core::{
    AnyStream, Channel, Connection, ConnectionMetadata, Multiaddr, MuxConfig, NewChannels,
    RejectionReason, Requests, SessionIdentity, discard_requests,
};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

fn identity(user: &str) -> SessionIdentity {
    SessionIdentity::new(
        user,
        b"loopback-session".to_vec(),
        b"SSH-2.0-sshconn_loopback_client".to_vec(),
        b"SSH-2.0-sshconn_loopback_server".to_vec(),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== sshconn loopback demo ===\n");

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (client_tcp, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client_tcp = client_tcp?;
    let (server_tcp, peer) = accepted?;

    let config = MuxConfig::from_env();
    let client_stream = AnyStream::io(
        client_tcp,
        Multiaddr::from(peer),
        Multiaddr::from(addr),
        &config,
    );
    let server_stream = AnyStream::io(
        server_tcp,
        Multiaddr::from(addr),
        Multiaddr::from(peer),
        &config,
    );

    // ========== SERVER SIDE ==========
    let (server, server_channels, server_requests) =
        Connection::new(identity("demo"), server_stream, config.clone());
    tokio::spawn(discard_requests(server_requests));
    let serving = tokio::spawn(serve(server_channels));

    // ========== CLIENT SIDE ==========
    let (client, _client_channels, client_requests) =
        Connection::new(identity("demo"), client_stream, config);
    tokio::spawn(discard_requests(client_requests));

    println!(
        "client {} -> server {} as {:?}",
        client.local_addr(),
        client.remote_addr(),
        client.user()
    );

    let (accepted, _) = client
        .send_request("keepalive@openssh.com", true, Bytes::new())
        .await?;
    println!("keepalive answered: {accepted}");

    match client.open_channel("direct-tcpip", Bytes::new()).await {
        Ok(_) => println!("direct-tcpip unexpectedly accepted"),
        Err(e) => println!("direct-tcpip refused: {e}"),
    }

    let (mut channel, channel_requests) = client.open_channel("session", Bytes::new()).await?;
    tokio::spawn(discard_requests(channel_requests));
    println!(
        "session open: local id {} remote id {}",
        channel.local_id(),
        channel.remote_id()
    );

    let ran = channel
        .send_request("exec", true, Bytes::from_static(b"echo"))
        .await?;
    println!("exec accepted: {ran}");

    for line in ["hello", "from", "the loopback"] {
        channel.write(Bytes::from(line)).await?;
        if let Some(echoed) = channel.read().await {
            println!("echo: {}", String::from_utf8_lossy(&echoed));
        }
    }
    channel.close_write().await?;
    while channel.read().await.is_some() {}
    channel.close().await?;

    client.close()?;
    client.wait().await?;
    // The server sees its peer go away.
    let outcome = server.wait().await;
    println!("server connection ended: {outcome:?}");
    serving.abort();

    println!("\n=== done ===");
    Ok(())
}

async fn serve(mut channels: NewChannels) {
    while let Some(new) = channels.recv().await {
        if new.channel_type() != "session" {
            let _ = new
                .reject(RejectionReason::UnknownChannelType, "only sessions here")
                .await;
            continue;
        }
        match new.accept().await {
            Ok((channel, requests)) => {
                tokio::spawn(answer_exec(requests));
                tokio::spawn(echo(channel));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

async fn answer_exec(mut requests: Requests) {
    while let Some(request) = requests.recv().await {
        let ok = request.name == "exec";
        tracing::info!(name = %request.name, ok, "channel request");
        if request.want_reply {
            let _ = request.reply(ok, Bytes::new()).await;
        }
    }
}

async fn echo(mut channel: Channel) {
    while let Some(data) = channel.read().await {
        if channel.write(data).await.is_err() {
            break;
        }
    }
    let _ = channel.close().await;
}
