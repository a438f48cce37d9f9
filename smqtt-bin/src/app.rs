use std::fmt;
use std::path::Path;

use anyhow::anyhow;
use rand::Rng;
use structopt::StructOpt;

use smqtt::logger::{logger_init, Logger};
use smqtt::{Client, ClientOptions, QoS};
use smqtt_conf::{Options, Settings};
use smqtt_net::{check_cert_files, CertificateBundle, TlsConnector};

pub type Result<T> = anyhow::Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loads settings from files, environment and command line, then installs the logger.
///
/// The returned logger must be kept alive for the lifetime of the program.
pub fn init() -> Result<(&'static Settings, Logger)> {
    let settings = Settings::init(Options::from_args())?;
    let logger = logger_init(&settings.log)?;
    Settings::logs();
    Ok((settings, logger))
}

/// An explicit id wins, otherwise `<prefix><role>-<0..=1000>`
pub fn client_id<R: Rng + ?Sized>(prefix: &str, explicit: Option<&str>, role: Role, rng: &mut R) -> String {
    match explicit {
        Some(id) => id.to_owned(),
        None => format!("{}{}-{}", prefix, role, rng.random_range(0..=1000)),
    }
}

#[inline]
pub fn qos(settings: &Settings) -> Result<QoS> {
    QoS::try_from(settings.app.qos).map_err(|_| anyhow!("qos must be 0, 1 or 2, got {}", settings.app.qos))
}

/// Checks the certificate files of `role` and prepares the TLS connector.
pub fn connector(settings: &Settings, role: Role) -> Result<TlsConnector> {
    let ca_cert = settings.tls.ca_cert();
    let client_cert = settings.tls.client_cert(role.as_str());
    let client_key = settings.tls.client_key(role.as_str());
    check_cert_files(&[Path::new(&ca_cert), Path::new(&client_cert), Path::new(&client_key)])?;

    let bundle = CertificateBundle::from_pem_files(&ca_cert, &client_cert, &client_key)?;
    let connector = TlsConnector::new(
        settings.broker.host.clone(),
        settings.broker.port,
        &bundle,
        Some(settings.broker.server_name()),
        settings.client.connect_timeout,
    )?;
    Ok(connector)
}

/// Opens the first connection, state transitions are logged from then on.
pub async fn connect(settings: &Settings, role: Role) -> Result<Client> {
    let connector = connector(settings, role)?;
    let client_id = client_id(
        &settings.client.client_id_prefix,
        settings.opts.client_id.as_deref(),
        role,
        &mut rand::rng(),
    );
    log::info!("{} connecting to {}", client_id, connector.addr());

    let client = Client::connect(connector, ClientOptions::from_settings(settings, client_id)).await?;
    let id = client.client_id().clone();
    client.on_state_change(move |state| log::info!("{} connection state: {}", id, state));
    Ok(client)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_client_id() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(client_id("edge-", Some("pub-1"), Role::Publisher, &mut rng), "pub-1");

        for _ in 0..100 {
            let id = client_id("edge-", None, Role::Subscriber, &mut rng);
            let n = id.strip_prefix("edge-subscriber-").unwrap();
            assert!(n.parse::<u16>().unwrap() <= 1000);
        }
        assert!(client_id("", None, Role::Publisher, &mut rng).starts_with("publisher-"));
    }
}
