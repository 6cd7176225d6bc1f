mod common;

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use sshconn_core::{
    AnyStream, Conn, ConnectionError, Multiaddr, MuxConfig, RejectionReason, discard_requests,
};

#[tokio::test]
async fn refused_open_renders_reason_and_message() {
    let Pair { client, server } = mem_pair();
    let _echo = serve_echo(server.new_channels);

    let err = within(client.conn.open_channel("X", empty()))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "rejected: administratively prohibited (no)");
    let rejection = err.as_rejection().expect("typed rejection");
    assert_eq!(rejection.reason, RejectionReason::AdministrativelyProhibited);
    assert_eq!(rejection.message, "no");
    assert!(!err.is_terminal());

    // A refusal leaves the connection usable.
    assert!(client.conn.phase().is_open());
    let (channel, _requests) = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap();
    assert_eq!(channel.channel_type(), "session");
}

#[tokio::test]
async fn data_round_trips_over_both_stream_kinds() {
    for Pair { client, server } in [mem_pair(), io_pair()] {
        let _echo = serve_echo(server.new_channels);
        let (mut channel, requests) = within(Conn::open_channel(&client.conn, "session", empty()))
            .await
            .unwrap();
        tokio::spawn(discard_requests(requests));

        channel.write(Bytes::from_static(b"hello")).await.unwrap();
        channel.write(Bytes::from_static(b", world")).await.unwrap();
        assert_eq!(within(channel.read()).await.unwrap(), "hello");
        assert_eq!(within(channel.read()).await.unwrap(), ", world");

        // EOF from us makes the echo side close, which ends our reads.
        channel.close_write().await.unwrap();
        assert_eq!(within(channel.read()).await, None);
        assert!(matches!(
            channel.write(Bytes::from_static(b"late")).await,
            Err(ConnectionError::ChannelClosed { .. })
        ));
        channel.close().await.unwrap();
        assert!(client.conn.phase().is_open());
    }
}

#[tokio::test]
async fn concurrent_opens_resolve_independently() {
    let Pair { client, server } = mem_pair();
    let _echo = serve_echo(server.new_channels);

    let opens = (0..8).map(|i| {
        let channel_type = if i % 3 == 0 { "direct-tcpip" } else { "session" };
        client.conn.open_channel(channel_type, empty())
    });
    let results = within(futures::future::join_all(opens)).await;

    let mut ids = HashSet::new();
    for (i, result) in results.into_iter().enumerate() {
        if i % 3 == 0 {
            assert!(result.unwrap_err().as_rejection().is_some());
        } else {
            let (channel, _requests) = result.unwrap();
            assert!(ids.insert(channel.local_id()));
        }
    }
    assert_eq!(ids.len(), 5);
}

#[tokio::test]
async fn inbound_opens_carry_type_and_extra_data() {
    let Pair { client, mut server } = mem_pair();
    let acceptor = tokio::spawn(async move {
        let new = server.new_channels.recv().await.unwrap();
        assert_eq!(new.channel_type(), "direct-tcpip");
        assert_eq!(new.extra_data(), &Bytes::from_static(b"target"));
        let (channel, requests) = new.accept().await.unwrap();
        (server, channel, requests)
    });

    let (channel, _requests) = within(
        client
            .conn
            .open_channel("direct-tcpip", Bytes::from_static(b"target")),
    )
    .await
    .unwrap();
    let (_server, server_channel, _server_requests) = within(acceptor).await.unwrap();

    assert_eq!(channel.remote_id(), server_channel.local_id());
    assert_eq!(server_channel.remote_id(), channel.local_id());
    assert_eq!(server_channel.channel_type(), "direct-tcpip");
}

#[tokio::test]
async fn unanswered_open_is_refused_with_resource_shortage() {
    let Pair { client, mut server } = mem_pair();
    let dropper = tokio::spawn(async move {
        let new = server.new_channels.recv().await.unwrap();
        drop(new);
        server
    });

    let err = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_rejection().map(|r| r.reason),
        Some(RejectionReason::ResourceShortage)
    );
    let _server = within(dropper).await.unwrap();
}

#[tokio::test]
async fn opens_without_a_listener_are_refused() {
    let Pair { client, server } = mem_pair();
    drop(server.new_channels);

    let err = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_rejection().map(|r| r.reason),
        Some(RejectionReason::UnknownChannelType)
    );
}

#[tokio::test]
async fn channel_limit_refuses_extra_opens() {
    let (a, b) = AnyStream::mem_pair(Multiaddr::memory(1), Multiaddr::memory(2));
    let Pair { client, server } = pair_over(a, b, MuxConfig::default().with_max_channels(1));
    let _echo = serve_echo(server.new_channels);

    let (_first, _requests) = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap();
    let err = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "rejected: resource shortage (too many channels)");
}

#[tokio::test]
async fn closing_the_connection_ends_channel_reads() {
    let Pair { client, server } = mem_pair();
    let _echo = serve_echo(server.new_channels);
    let (mut channel, _requests) = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap();

    let reader = tokio::spawn(async move { channel.read().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.conn.close().unwrap();

    assert_eq!(within(reader).await.unwrap(), None);
}

#[tokio::test]
async fn dropping_a_channel_closes_it_on_the_peer() {
    let Pair { client, mut server } = mem_pair();
    let acceptor = tokio::spawn(async move {
        let new = server.new_channels.recv().await.unwrap();
        let (channel, requests) = new.accept().await.unwrap();
        (server, channel, requests)
    });

    let (channel, _requests) = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap();
    let (_server, mut server_channel, mut server_requests) = within(acceptor).await.unwrap();

    drop(channel);
    assert_eq!(within(server_channel.read()).await, None);
    assert!(within(server_requests.recv()).await.is_none());
}
