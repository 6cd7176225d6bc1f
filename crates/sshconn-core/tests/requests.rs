mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use sshconn_core::{ConnectionError, discard_requests};
use tokio::sync::mpsc;

#[tokio::test]
async fn fire_and_forget_returns_immediately() {
    let Pair { client, mut server } = mem_pair();
    let (ok, payload) = within(client.conn.send_request(
        "no-more-sessions@openssh.com",
        false,
        Bytes::from_static(b"x"),
    ))
    .await
    .unwrap();
    assert!(!ok);
    assert!(payload.is_empty());

    let request = within(server.requests.recv()).await.unwrap();
    assert_eq!(request.name, "no-more-sessions@openssh.com");
    assert!(!request.want_reply);
    assert_eq!(request.payload, Bytes::from_static(b"x"));
}

#[tokio::test]
async fn reply_carries_acceptance_and_payload() {
    let Pair { client, mut server } = mem_pair();
    let server = tokio::spawn(async move {
        let request = server.requests.recv().await.unwrap();
        assert_eq!(request.name, "tcpip-forward");
        request.reply(true, Bytes::from_static(b"\x00\x00\x1f\x90")).await.unwrap();
        server
    });

    let (ok, payload) = within(client.conn.send_request(
        "tcpip-forward",
        true,
        Bytes::from_static(b"\x00\x00\x00\x00"),
    ))
    .await
    .unwrap();
    assert!(ok);
    assert_eq!(payload, Bytes::from_static(b"\x00\x00\x1f\x90"));
    let _server = within(server).await.unwrap();
}

#[tokio::test]
async fn replies_arrive_in_order_even_when_the_first_is_slow() {
    let Pair { client, mut server } = mem_pair();
    let server = tokio::spawn(async move {
        for expected in ["first", "second"] {
            let request = server.requests.recv().await.unwrap();
            assert_eq!(request.name, expected);
            if expected == "first" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            request
                .reply(true, Bytes::from(expected.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        server
    });

    let client = Arc::new(client.conn);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut tasks = Vec::new();
    for name in ["first", "second"] {
        let client = client.clone();
        let done_tx = done_tx.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client.send_request(name, true, empty()).await;
            let _ = done_tx.send(name);
            reply
        }));
        // Both requests are on the wire before the first reply comes back.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first = within(tasks.remove(0)).await.unwrap().unwrap();
    let second = within(tasks.remove(0)).await.unwrap().unwrap();
    assert_eq!(first, (true, Bytes::from_static(b"first")));
    assert_eq!(second, (true, Bytes::from_static(b"second")));
    assert_eq!(done_rx.recv().await, Some("first"));
    assert_eq!(done_rx.recv().await, Some("second"));
    let _server = within(server).await.unwrap();
}

#[tokio::test]
async fn dropped_request_is_refused() {
    let Pair { client, mut server } = mem_pair();
    let server = tokio::spawn(async move {
        let request = server.requests.recv().await.unwrap();
        drop(request);
        server
    });

    let reply = within(client.conn.send_request("ignored", true, empty()))
        .await
        .unwrap();
    assert_eq!(reply, (false, Bytes::new()));
    let _server = within(server).await.unwrap();
}

#[tokio::test]
async fn dropped_request_keeps_its_place_in_reply_order() {
    let Pair { client, mut server } = mem_pair();
    let server = tokio::spawn(async move {
        let first = server.requests.recv().await.unwrap();
        let second = server.requests.recv().await.unwrap();
        assert_eq!(second.name, "second");
        drop(first);
        second
            .reply(true, Bytes::from_static(b"second"))
            .await
            .unwrap();
        server
    });

    let client = Arc::new(client.conn);
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.send_request("first", true, empty()).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.send_request("second", true, empty()).await })
    };

    assert_eq!(within(first).await.unwrap().unwrap(), (false, Bytes::new()));
    assert_eq!(
        within(second).await.unwrap().unwrap(),
        (true, Bytes::from_static(b"second"))
    );
    let _server = within(server).await.unwrap();
}

#[tokio::test]
async fn channel_answers_given_out_of_order_are_sent_in_order() {
    let Pair { client, mut server } = mem_pair();
    let acceptor = tokio::spawn(async move {
        let new = server.new_channels.recv().await.unwrap();
        let (channel, mut requests) = new.accept().await.unwrap();
        let first = requests.recv().await.unwrap();
        let second = requests.recv().await.unwrap();
        assert_eq!(first.name, "pty-req");
        second.reply(false, empty()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.reply(true, empty()).await.unwrap();
        (server, channel, requests)
    });

    let (channel, _requests) = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap();
    let (pty, shell) = within(async {
        tokio::join!(
            channel.send_request("pty-req", true, empty()),
            channel.send_request("shell", true, empty()),
        )
    })
    .await;
    assert!(pty.unwrap());
    assert!(!shell.unwrap());
    let _ = within(acceptor).await.unwrap();
}

#[tokio::test]
async fn discard_refuses_exactly_the_requests_that_want_a_reply() {
    let Pair { client, server } = mem_pair();
    tokio::spawn(discard_requests(server.requests));
    let conn = &client.conn;

    for (name, want_reply) in [("a", true), ("b", false), ("c", true), ("d", false), ("e", true)] {
        let reply = within(conn.send_request(name, want_reply, Bytes::from_static(b"p")))
            .await
            .unwrap();
        assert_eq!(reply, (false, Bytes::new()), "request {name}");
    }

    // A stray reply for a fire-and-forget request would have been an
    // unsolicited reply and torn the connection down.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(conn.phase().is_open());
    assert_eq!(
        within(conn.send_request("f", true, empty())).await.unwrap(),
        (false, Bytes::new())
    );
}

#[tokio::test]
async fn discard_returns_when_the_source_closes() {
    let Pair { client, server } = mem_pair();
    let drain = tokio::spawn(discard_requests(server.requests));

    client.conn.send_request("a", false, empty()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!drain.is_finished());

    client.conn.close().unwrap();
    within(drain).await.unwrap();
}

#[tokio::test]
async fn discard_on_a_channel_keeps_the_connection_moving() {
    let Pair { client, mut server } = mem_pair();
    let acceptor = tokio::spawn(async move {
        let new = server.new_channels.recv().await.unwrap();
        let (channel, requests) = new.accept().await.unwrap();
        tokio::spawn(discard_requests(requests));
        (server, channel)
    });
    tokio::spawn(discard_requests(client.requests));

    let (channel, _client_requests) = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap();
    let (_server, _server_channel) = within(acceptor).await.unwrap();

    // Far more requests than any buffer holds.
    for i in 0..100 {
        let want_reply = i % 2 == 0;
        let accepted = within(channel.send_request("env", want_reply, empty()))
            .await
            .unwrap();
        assert!(!accepted);
    }
    assert!(client.conn.phase().is_open());
}

#[tokio::test]
async fn channel_requests_are_answered_in_order() {
    let Pair { client, mut server } = mem_pair();
    let acceptor = tokio::spawn(async move {
        let new = server.new_channels.recv().await.unwrap();
        let (channel, mut requests) = new.accept().await.unwrap();
        let mut seen = Vec::new();
        while let Some(request) = requests.recv().await {
            let name = request.name.clone();
            match name.as_str() {
                "exec" => {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    request.reply(true, empty()).await.unwrap();
                }
                "pty-req" => request.reply(true, empty()).await.unwrap(),
                _ => request.reply(false, empty()).await.unwrap(),
            }
            seen.push(name);
            if seen.len() == 3 {
                break;
            }
        }
        (server, channel, seen)
    });

    let (channel, _requests) = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap();
    let (exec, env, pty) = within(async {
        tokio::join!(
            channel.send_request("exec", true, Bytes::from_static(b"\x00\x00\x00\x02ls")),
            channel.send_request("env", true, empty()),
            channel.send_request("pty-req", true, empty()),
        )
    })
    .await;
    assert!(exec.unwrap());
    assert!(!env.unwrap());
    assert!(pty.unwrap());

    let (_server, _channel, seen) = within(acceptor).await.unwrap();
    assert_eq!(seen, ["exec", "env", "pty-req"]);
}

#[tokio::test]
async fn request_on_a_channel_the_peer_closed_fails() {
    let Pair { client, mut server } = mem_pair();
    let acceptor = tokio::spawn(async move {
        let new = server.new_channels.recv().await.unwrap();
        let (channel, _requests) = new.accept().await.unwrap();
        channel.close().await.unwrap();
        server
    });

    let (mut channel, mut requests) = within(client.conn.open_channel("session", empty()))
        .await
        .unwrap();
    let _server = within(acceptor).await.unwrap();

    assert_eq!(within(channel.read()).await, None);
    assert!(within(requests.recv()).await.is_none());
    let err = within(channel.send_request("exec", true, empty()))
        .await
        .unwrap_err();
    let local_id = channel.local_id();
    assert!(matches!(err, ConnectionError::ChannelClosed { channel } if channel == local_id));
    assert!(matches!(
        within(channel.write(Bytes::from_static(b"late"))).await,
        Err(ConnectionError::ChannelClosed { .. })
    ));
}
