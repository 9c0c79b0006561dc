//! Two actors in one container playing ping/pong.
//!
//! Run with: `cargo run -p colony-container --example ping_pong`

use colony_container::{BehaviorFn, Container, Delivery, SendOptions};
use colony_types::StartOptions;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let container = Container::new();

    container.add_actor(
        "pong",
        BehaviorFn(|_ctx, delivery: Delivery| {
            println!("pong received {:?} from {}", delivery.content(), delivery.request.from);
            delivery.reply_ok("pong");
            Ok(())
        }),
    )?;
    container.add_actor("ping", BehaviorFn(|_ctx, _delivery| Ok(())))?;

    container.start(StartOptions::default()).await?;

    let res = container
        .call("ping", "pong", json!("ping"), SendOptions::default())
        .await?;
    println!("ping received {:?}", res.content);

    container.stop().await?;
    Ok(())
}
