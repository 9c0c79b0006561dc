//! End-to-end tests of the request pipeline inside one container:
//! in-process round trips, timeouts, middleware, the starting queue and
//! lifecycle boundaries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use colony_container::{
    ActorContext, BehaviorFn, Container, ContainerEvent, Delivery, Flow, Middleware, MiddlewareFn,
    PipelineMessage, ReplySlot, Scope, SendOptions,
};
use colony_types::{ErrorInfo, MessageKind, StartOptions, NOTFOUND, TECHERR, TIMEOUT};
use serde_json::{json, Value};
use tokio::sync::mpsc;

async fn started_container() -> Container {
    let container = Container::new();
    container
        .start(StartOptions {
            ip: Some("127.0.0.1".parse().unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();
    container
}

#[tokio::test]
async fn in_process_ping_pong() {
    let container = started_container().await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    container
        .add_actor("ping", BehaviorFn(|_ctx, _delivery| Ok(())))
        .unwrap();
    container
        .add_actor(
            "pong",
            BehaviorFn(move |_ctx, delivery: Delivery| {
                seen_tx.send(delivery.request.clone()).unwrap();
                delivery.reply_ok("pong");
                Ok(())
            }),
        )
        .unwrap();

    let res = container
        .call("ping", "pong", json!("ping"), SendOptions::default())
        .await
        .unwrap();

    assert_eq!(res.content, json!("pong"));
    assert!(res.err.is_none());

    let delivered = seen_rx.recv().await.unwrap();
    assert_eq!(delivered.content, json!("ping"));
    // Both sides arrive fully qualified even though the caller used bare ids.
    assert!(delivered.from.starts_with("ping/"));
    assert!(delivered.to.starts_with("pong/"));
    assert_eq!(res.id, delivered.id);
    assert_eq!(res.to, delivered.from);
}

#[tokio::test]
async fn call_to_nobody_times_out() {
    let container = started_container().await;
    // Keep the search window out of the picture so the request deadline
    // is what fires.
    container.set("researchTimeout", json!(5_000));

    let begin = Instant::now();
    let err = container
        .call("a", "nobody", json!("hi"), SendOptions::with_timeout(50))
        .await
        .unwrap_err();

    assert_eq!(err.code, TIMEOUT);
    let elapsed = begin.elapsed();
    assert!(elapsed >= Duration::from_millis(45), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
}

#[tokio::test]
async fn exhausted_search_reports_notfound() {
    let container = started_container().await;
    container.set("researchTimeout", json!(50));

    // NOTFOUND is a synthetic completion: it never touched a transport,
    // so a middleware swallowing every incoming response must not be able
    // to intercept it.
    container.use_middleware(MiddlewareFn(
        |kind, _msg: &mut PipelineMessage, _reply: &mut ReplySlot| {
            if kind == MessageKind::ResIn {
                return Flow::Halt;
            }
            Flow::Continue
        },
    ));

    let begin = Instant::now();
    let err = container
        .call("a", "nobody", json!("hi"), SendOptions::with_timeout(2_000))
        .await
        .unwrap_err();
    assert_eq!(err.code, NOTFOUND);
    assert!(
        begin.elapsed() < Duration::from_secs(1),
        "NOTFOUND should arrive at the research timeout, not the deadline"
    );
}

#[tokio::test]
async fn middleware_can_refuse_a_request() {
    let container = started_container().await;

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_clone = Arc::clone(&handled);
    container
        .add_actor(
            "vault",
            BehaviorFn(move |_ctx, delivery: Delivery| {
                handled_clone.fetch_add(1, Ordering::SeqCst);
                delivery.reply_ok("secret");
                Ok(())
            }),
        )
        .unwrap();

    container.use_middleware(MiddlewareFn(
        |kind, _msg: &mut PipelineMessage, reply: &mut colony_container::ReplySlot| {
            if kind == MessageKind::ReqIn {
                reply.reply(Err(ErrorInfo::new("FORBIDDEN")));
                return Flow::Halt;
            }
            Flow::Continue
        },
    ));

    let err = container
        .call("intruder", "vault", Value::Null, SendOptions::with_timeout(1_000))
        .await
        .unwrap_err();

    assert_eq!(err.code, "FORBIDDEN");
    assert_eq!(handled.load(Ordering::SeqCst), 0, "handler must not run");
}

#[tokio::test]
async fn middleware_sees_stations_in_registration_order() {
    let container = started_container().await;
    container
        .add_actor(
            "echo",
            BehaviorFn(|_ctx, delivery: Delivery| {
                let content = delivery.content().clone();
                delivery.reply_ok(content);
                Ok(())
            }),
        )
        .unwrap();

    let stations = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let stations = Arc::clone(&stations);
        container.use_middleware(MiddlewareFn(
            move |kind, _msg: &mut PipelineMessage, _reply: &mut colony_container::ReplySlot| {
                stations.lock().push((tag, kind));
                Flow::Continue
            },
        ));
    }

    container
        .call("a", "echo", json!(1), SendOptions::default())
        .await
        .unwrap();

    let seen = stations.lock().clone();
    let expected_kinds = [
        MessageKind::ReqOut,
        MessageKind::ReqIn,
        MessageKind::ResOut,
        MessageKind::ResIn,
    ];
    assert_eq!(seen.len(), 8);
    for (station, kind) in expected_kinds.iter().enumerate() {
        assert_eq!(seen[station * 2], ("first", *kind));
        assert_eq!(seen[station * 2 + 1], ("second", *kind));
    }
}

#[tokio::test]
async fn starting_queue_drains_in_order() {
    let container = Container::new();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    container
        .add_actor(
            "sink",
            BehaviorFn(move |_ctx, delivery: Delivery| {
                seen_tx.send(delivery.content().clone()).unwrap();
                Ok(())
            }),
        )
        .unwrap();

    for n in 1..=3 {
        container
            .send("feeder", "sink", json!(n), SendOptions::default())
            .await;
    }

    container
        .start(StartOptions {
            ip: Some("127.0.0.1".parse().unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();

    for expected in 1..=3 {
        let content = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .expect("queued send was not delivered")
            .unwrap();
        assert_eq!(content, json!(expected));
    }
}

/// Stretches the outgoing pipeline so the starting-queue drain stays open
/// long enough for a concurrent sender to race it.
struct SlowOutbound;

#[async_trait]
impl Middleware for SlowOutbound {
    async fn apply(
        &self,
        kind: MessageKind,
        _msg: &mut PipelineMessage,
        _reply: &mut ReplySlot,
    ) -> Flow {
        if kind == MessageKind::ReqOut {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Flow::Continue
    }
}

#[tokio::test]
async fn sends_racing_the_drain_stay_behind_the_queue() {
    let container = Container::new();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    container
        .add_actor(
            "sink",
            BehaviorFn(move |_ctx, delivery: Delivery| {
                seen_tx.send(delivery.content().clone()).unwrap();
                Ok(())
            }),
        )
        .unwrap();
    container.use_middleware(SlowOutbound);

    for n in 1..=3 {
        container
            .send("feeder", "sink", json!(n), SendOptions::default())
            .await;
    }

    // Fires mid-drain: with three queued sends each held ~30ms at the
    // outgoing station, the drain is still running 40ms in. The racer
    // must land behind the queue, never ahead of it.
    let racer = {
        let container = container.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            container
                .send("feeder", "sink", json!(4), SendOptions::default())
                .await;
        })
    };

    container
        .start(StartOptions {
            ip: Some("127.0.0.1".parse().unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();
    racer.await.unwrap();

    for expected in 1..=4 {
        let content = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .expect("send was not delivered")
            .unwrap();
        assert_eq!(content, json!(expected));
    }
}

#[tokio::test]
async fn bare_actor_ids_gain_a_resource_and_emit_added() {
    let container = Container::new();
    let mut events = container.subscribe();

    let full = container
        .add_actor("worker", BehaviorFn(|_ctx, _delivery| Ok(())))
        .unwrap();
    assert_eq!(full.bare(), "worker");
    assert!(full.resource().is_some());

    match events.try_recv().unwrap() {
        ContainerEvent::ActorAdded { aid, scope } => {
            assert_eq!(aid, full.to_string());
            assert_eq!(scope, Scope::Process);
        }
        other => panic!("expected ActorAdded, got {other:?}"),
    }
}

#[tokio::test]
async fn add_remove_add_is_idempotent() {
    let container = Container::new();

    let full = container
        .add_actor("worker/fixed", BehaviorFn(|_ctx, _delivery| Ok(())))
        .unwrap();
    container.remove_actor(&full.to_string()).unwrap();
    // Second removal is a no-op.
    container.remove_actor(&full.to_string()).unwrap();
    let again = container
        .add_actor("worker/fixed", BehaviorFn(|_ctx, _delivery| Ok(())))
        .unwrap();
    assert_eq!(full, again);
}

#[tokio::test]
async fn invalid_ids_and_params_are_techerr() {
    let container = Container::new();

    let err = container
        .add_actor("/nope", BehaviorFn(|_ctx, _delivery| Ok(())))
        .unwrap_err();
    assert_eq!(err.code, TECHERR);

    let err = container.remove_actor("also/").unwrap_err();
    assert_eq!(err.code, TECHERR);

    let err = container
        .start_with_value(json!({"definitelyNotAnOption": true}))
        .await
        .unwrap_err();
    assert_eq!(err.code, TECHERR);

    // An invalid target id fails validation before anything is dispatched.
    let started = started_container().await;
    let err = started
        .call("a", "bad/", Value::Null, SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, TECHERR);
}

#[tokio::test]
async fn lifecycle_round_trip_keeps_working() {
    let container = Container::new();
    container
        .add_actor(
            "echo",
            BehaviorFn(|_ctx, delivery: Delivery| {
                let content = delivery.content().clone();
                delivery.reply_ok(content);
                Ok(())
            }),
        )
        .unwrap();

    let opts = StartOptions {
        ip: Some("127.0.0.1".parse().unwrap()),
        ..Default::default()
    };
    container.start(opts.clone()).await.unwrap();
    // Double start is a logged no-op.
    container.start(opts.clone()).await.unwrap();

    container.stop().await.unwrap();
    container.stop().await.unwrap();

    container.start(opts).await.unwrap();
    let res = container
        .call("a", "echo", json!(42), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(res.content, json!(42));
}

#[tokio::test]
async fn send_after_stop_is_refused() {
    let container = started_container().await;
    container.stop().await.unwrap();

    // Fire-and-forget is a logged no-op; an awaited call resolves with
    // TECHERR instead of hanging.
    container
        .send("a", "anyone", Value::Null, SendOptions::default())
        .await;
    let err = container
        .call("a", "anyone", Value::Null, SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, TECHERR);
}

#[tokio::test]
async fn actor_context_send_injects_from() {
    let container = started_container().await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    container
        .add_actor(
            "target",
            BehaviorFn(move |_ctx, delivery: Delivery| {
                seen_tx.send(delivery.request.from.clone()).unwrap();
                delivery.reply_ok(Value::Null);
                Ok(())
            }),
        )
        .unwrap();

    let relay = container.add_actor(
        "relay",
        BehaviorFn(|ctx: ActorContext, delivery: Delivery| {
            tokio::spawn(async move {
                let _ = ctx
                    .call("target", json!("forwarded"), SendOptions::default())
                    .await;
            });
            delivery.reply_ok(Value::Null);
            Ok(())
        }),
    );
    let relay = relay.unwrap();

    container
        .call("kickoff", "relay", Value::Null, SendOptions::default())
        .await
        .unwrap();

    let from = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("relay never reached the target")
        .unwrap();
    assert_eq!(from, relay.to_string());
}

#[tokio::test]
async fn stats_toggle_counts_requests() {
    let container = Container::new();
    container
        .add_actor(
            "echo",
            BehaviorFn(|_ctx, delivery: Delivery| {
                let content = delivery.content().clone();
                delivery.reply_ok(content);
                Ok(())
            }),
        )
        .unwrap();
    container
        .start(StartOptions {
            ip: Some("127.0.0.1".parse().unwrap()),
            stats: Some(colony_types::StatsToggle::On),
            ..Default::default()
        })
        .await
        .unwrap();

    container
        .call("a", "echo", json!(1), SendOptions::default())
        .await
        .unwrap();

    let stats = container.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.requests_delivered, 1);
    assert_eq!(stats.responses_received, 1);
}
