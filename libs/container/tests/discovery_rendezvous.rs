//! Cross-container resolution through the multicast rendezvous: search,
//! answer, and departure handling. Each test uses its own rendezvous port
//! so concurrent tests do not hear each other.

use std::time::Duration;

use colony_container::{BehaviorFn, Container, Delivery, SendOptions};
use colony_types::StartOptions;
use serde_json::json;

fn rendezvous_options(port: u16) -> StartOptions {
    StartOptions {
        ip: Some("127.0.0.1".parse().unwrap()),
        discovery_addr: Some("224.0.0.1".into()),
        discovery_port: Some(port),
        ..Default::default()
    }
}

#[tokio::test]
async fn cross_container_call_resolves_via_search() {
    let hosting = Container::new();
    hosting
        .add_actor(
            "pong",
            BehaviorFn(|_ctx, delivery: Delivery| {
                delivery.reply_ok("pong");
                Ok(())
            }),
        )
        .unwrap();
    hosting.start(rendezvous_options(45_711)).await.unwrap();

    // The caller joins after the host announced, so resolution must go
    // through a SEARCH/ANSWER round, not the cached announcement.
    let caller = Container::new();
    caller
        .add_actor("ping", BehaviorFn(|_ctx, _delivery| Ok(())))
        .unwrap();
    caller.start(rendezvous_options(45_711)).await.unwrap();

    let res = caller
        .call("ping", "pong", json!("ping"), SendOptions::with_timeout(5_000))
        .await
        .unwrap();
    assert_eq!(res.content, json!("pong"));
}

#[tokio::test]
async fn late_joiner_is_found_through_announce() {
    let caller = Container::new();
    caller.start(rendezvous_options(45_713)).await.unwrap();

    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move {
            caller
                .call("ping", "pong", json!("ping"), SendOptions::with_timeout(10_000))
                .await
        })
    };

    // Let the first search go unanswered before the host appears.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let hosting = Container::new();
    hosting
        .add_actor(
            "pong",
            BehaviorFn(|_ctx, delivery: Delivery| {
                delivery.reply_ok("pong");
                Ok(())
            }),
        )
        .unwrap();
    hosting.start(rendezvous_options(45_713)).await.unwrap();

    let res = pending.await.unwrap().unwrap();
    assert_eq!(res.content, json!("pong"));
}

#[tokio::test]
async fn departed_peer_is_forgotten() {
    let hosting = Container::new();
    let pong = hosting
        .add_actor(
            "pong",
            BehaviorFn(|_ctx, delivery: Delivery| {
                delivery.reply_ok("pong");
                Ok(())
            }),
        )
        .unwrap();
    hosting.start(rendezvous_options(45_715)).await.unwrap();

    let caller = Container::new();
    caller.start(rendezvous_options(45_715)).await.unwrap();

    caller
        .call("ping", "pong", json!("ping"), SendOptions::with_timeout(5_000))
        .await
        .unwrap();

    hosting.stop().await.unwrap();

    // The LEAVE datagram clears every entry the host owned.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if caller.registry().get(&pong, None).is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "departed peer still in registry"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
