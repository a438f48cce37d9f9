#![deny(unsafe_code)]

use std::process;

use anyhow::anyhow;

use smqtt::ConnectionState;
use smqtt_bin::{app, Role, Sample};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        log::error!("publisher stopped, {:?}", e);
        eprintln!("smqtt-pub: {:?}", e);
        process::exit(1);
    }
}

async fn run() -> app::Result<()> {
    let (settings, _logger) = app::init()?;
    let qos = app::qos(settings)?;
    let client = app::connect(settings, Role::Publisher).await?;
    let topic = settings.app.topic.clone();
    log::info!("publishing to {} every {:?}, qos {}", topic, settings.app.interval, qos);

    let mut state_rx = client.state_receiver();
    let mut ticker = tokio::time::interval(settings.app.interval);
    let mut message_id = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                message_id += 1;
                let payload = Sample::generate(message_id, &mut rand::rng()).to_json()?;
                let client = client.clone();
                let topic = topic.clone();
                tokio::spawn(async move {
                    match client.publish(topic, payload.clone(), qos, false).await {
                        Ok(_) => log::info!("Sent message: {}", payload),
                        Err(e) => log::warn!("publish message {} failed, {}", message_id, e),
                    }
                });
            }
            _ = state_rx.wait_for(|s| *s == ConnectionState::PermanentlyDisconnected) => {
                return Err(anyhow!("broker unreachable, reconnection attempts exhausted"));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    log::info!("interrupted, disconnecting");
    client.disconnect().await;
    Ok(())
}
