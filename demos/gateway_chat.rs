//! Gateway chat example.
//!
//! Connects to an OpenClaw gateway, lists recent sessions, sends one chat
//! message to the first session and prints chat events until the reply is
//! final.
//!
//! Before running:
//! - Set `OPENCLAW_GATEWAY_URL` and `OPENCLAW_GATEWAY_TOKEN`, or pass the path
//!   of a saved server config as the first argument.
//! - Optionally pass the message text as the second argument.
//!
//! Set `RUST_LOG=openclaw_control_sdk=debug` to see protocol traffic.

use std::error::Error;
use std::time::Duration;

use openclaw_control_sdk::config::ServerConfig;
use openclaw_control_sdk::gateway::{
    GatewayClient, GatewayClientOptions, GatewaySession, SubscriptionScope,
};
use openclaw_control_sdk::models::{ChatSendParams, SessionsListParams};
use openclaw_control_sdk::retry::RetryPolicy;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    }
    .with_env_overrides();
    let message = args.next().unwrap_or_else(|| "ping from rust".to_string());

    let client = GatewayClient::with_options(
        GatewayClientOptions::default().with_reconnect(RetryPolicy::reconnect()),
    );
    let (_, mut events) = client.event_channel(SubscriptionScope::Client);
    let (session, hello) = GatewaySession::connect(client, config.connect_config()?).await?;
    println!("connected protocol={:?}", hello.protocol());

    let list = session
        .list_sessions(&SessionsListParams {
            active_minutes: Some(120),
            limit: Some(10),
        })
        .await?;
    for summary in &list.sessions {
        println!(
            "session key={} model={}",
            summary.key,
            summary.model.as_deref().unwrap_or("-")
        );
    }
    let Some(target) = list.sessions.first() else {
        println!("no active sessions");
        session.disconnect().await;
        return Ok(());
    };

    let ack = session
        .send_chat(ChatSendParams::new(target.key.clone(), message))
        .await?;
    println!("sent run_id={}", ack.run_id.as_deref().unwrap_or("-"));

    loop {
        let event = match tokio::time::timeout(Duration::from_secs(60), events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                eprintln!("no final reply within 60s");
                break;
            }
        };
        if event.name != "chat" {
            continue;
        }
        println!("chat {}", event.payload);
        if event.payload.get("state").and_then(|state| state.as_str()) == Some("final") {
            break;
        }
    }

    session.disconnect().await;
    Ok(())
}
