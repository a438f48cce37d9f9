use std::time::Duration;

use simple_logger::SimpleLogger;

use smqtt::{Client, ClientOptions, Message, QoS};
use smqtt_net::{CertificateBundle, TlsConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new().with_level(log::LevelFilter::Info).init()?;

    let bundle = CertificateBundle::from_pem_files(
        "./certs/ca/ca.crt",
        "./certs/clients/publisher.crt",
        "./certs/clients/publisher.key",
    )?;
    let connector = TlsConnector::new("localhost", 8883, &bundle, None, Duration::from_secs(10))?;

    let opts = ClientOptions::new("simple-tls").keepalive(Duration::from_secs(30));
    let client = Client::connect(connector, opts).await?;
    client.on_state_change(|state| log::info!("connection state: {}", state));

    let granted = client
        .subscribe("signals/#", QoS::AtLeastOnce, |msg: &Message| {
            log::info!("received {:?}: {}", msg, String::from_utf8_lossy(&msg.payload))
        })
        .await?;
    log::info!("subscribed, granted qos {}", granted);

    for n in 0..3 {
        let ack = client.publish("signals/simple", format!("hello {}", n), QoS::ExactlyOnce, false).await?;
        log::info!("published {:?}", ack);
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    client.disconnect().await;
    Ok(())
}
