//! Peer transport end-to-end: framed request/response between two bound
//! transports, and drop signalling when the peer cannot be reached.

use colony_network::{RemoteTransport, TransportEvent};
use colony_types::{Headers, NetInfo, Request, Response};
use serde_json::json;
use tokio::sync::mpsc;

fn net_info(id: &str) -> NetInfo {
    NetInfo {
        id: id.into(),
        ip: "127.0.0.1".parse().unwrap(),
        pid: std::process::id(),
        port: 0,
    }
}

fn request(id: &str) -> Request {
    Request {
        id: id.into(),
        from: "ping/a".into(),
        to: "pong/b".into(),
        content: json!("ping"),
        headers: Headers::new(),
        date: colony_types::now_ms(),
        timeout: 5_000,
        cb: true,
    }
}

#[tokio::test]
async fn request_response_round_trip() {
    let (tx_a, mut events_a) = mpsc::unbounded_channel();
    let (tx_b, mut events_b) = mpsc::unbounded_channel();
    let a = RemoteTransport::new(tx_a);
    let b = RemoteTransport::new(tx_b);

    let _a_net = a.start(net_info("container-a")).await.unwrap();
    let b_net = b.start(net_info("container-b")).await.unwrap();
    assert_ne!(b_net.port, 0);

    a.send(&b_net, request("r-1")).await;

    match events_b.recv().await.unwrap() {
        TransportEvent::Request { request, responder } => {
            assert_eq!(request.id, "r-1");
            assert_eq!(request.content, json!("ping"));
            responder.reply(Response::to_request(&request, Ok(json!("pong"))));
        }
        other => panic!("expected Request, got {other:?}"),
    }

    match events_a.recv().await.unwrap() {
        TransportEvent::Response(res) => {
            assert_eq!(res.id, "r-1");
            assert_eq!(res.to, "ping/a");
            assert_eq!(res.content, json!("pong"));
        }
        other => panic!("expected Response, got {other:?}"),
    }
}

#[tokio::test]
async fn connection_is_reused_for_subsequent_requests() {
    let (tx_a, _events_a) = mpsc::unbounded_channel();
    let (tx_b, mut events_b) = mpsc::unbounded_channel();
    let a = RemoteTransport::new(tx_a);
    let b = RemoteTransport::new(tx_b);

    a.start(net_info("container-a")).await.unwrap();
    let b_net = b.start(net_info("container-b")).await.unwrap();

    a.send(&b_net, request("r-1")).await;
    a.send(&b_net, request("r-2")).await;

    for expected in ["r-1", "r-2"] {
        match events_b.recv().await.unwrap() {
            TransportEvent::Request { request, .. } => assert_eq!(request.id, expected),
            other => panic!("expected Request, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn unreachable_peer_emits_drop() {
    let (tx_a, mut events_a) = mpsc::unbounded_channel();
    let a = RemoteTransport::new(tx_a);
    a.start(net_info("container-a")).await.unwrap();

    // A freshly released port: nothing listens there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut ghost = net_info("ghost");
    ghost.port = listener.local_addr().unwrap().port();
    drop(listener);

    a.send(&ghost, request("r-1")).await;

    match events_a.recv().await.unwrap() {
        TransportEvent::Dropped(req) => assert_eq!(req.id, "r-1"),
        other => panic!("expected Dropped, got {other:?}"),
    }
}

#[tokio::test]
async fn send_before_start_drops() {
    let (tx_a, mut events_a) = mpsc::unbounded_channel();
    let a = RemoteTransport::new(tx_a);

    a.send(&net_info("anyone"), request("r-1")).await;

    match events_a.recv().await.unwrap() {
        TransportEvent::Dropped(req) => assert_eq!(req.id, "r-1"),
        other => panic!("expected Dropped, got {other:?}"),
    }
}
