#![deny(unsafe_code)]

use std::process;

use anyhow::anyhow;

use smqtt::{ConnectionState, Message};
use smqtt_bin::{app, sample, Role};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        log::error!("subscriber stopped, {:?}", e);
        eprintln!("smqtt-sub: {:?}", e);
        process::exit(1);
    }
}

async fn run() -> app::Result<()> {
    let (settings, _logger) = app::init()?;
    let qos = app::qos(settings)?;
    let client = app::connect(settings, Role::Subscriber).await?;
    let topic = settings.app.topic.clone();

    let granted = client.subscribe(topic.clone(), qos, |msg: &Message| sample::report(msg)).await?;
    log::info!("subscribed to {}, granted qos {}", topic, granted);

    let mut state_rx = client.state_receiver();
    tokio::select! {
        _ = state_rx.wait_for(|s| *s == ConnectionState::PermanentlyDisconnected) => {
            return Err(anyhow!("broker unreachable, reconnection attempts exhausted"));
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    log::info!("interrupted, disconnecting");
    client.disconnect().await;
    Ok(())
}
