#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, Environment, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use smqtt_utils::*;

use self::logging::{Level, Log};

pub use self::options::Options;

pub mod logging;
pub mod options;

pub type Result<T> = anyhow::Result<T>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub client: Client,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub reconnect: Reconnect,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/smqtt/smqtt").required(false))
            .add_source(File::with_name("smqtt").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("smqtt").prefix_separator("_").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(host) = opts.broker.as_ref() {
            inner.broker.host.clone_from(host);
        }
        if let Some(port) = opts.port {
            inner.broker.port = port;
        }
        if let Some(topic) = opts.topic.as_ref() {
            inner.app.topic.clone_from(topic);
        }
        if let Some(interval) = opts.interval {
            if !interval.is_finite() || interval <= 0.0 {
                return Err(anyhow!("interval must be a positive number of seconds, got {}", interval));
            }
            inner.app.interval = Duration::from_secs_f64(interval);
        }
        if let Some(qos) = opts.qos {
            inner.app.qos = qos;
        }
        if opts.ca_cert.is_some() {
            inner.tls.ca_cert.clone_from(&opts.ca_cert);
        }
        if opts.client_cert.is_some() {
            inner.tls.client_cert.clone_from(&opts.client_cert);
        }
        if opts.client_key.is_some() {
            inner.tls.client_key.clone_from(&opts.client_key);
        }
        if opts.debug {
            inner.log.level = Level::debug();
        }

        if inner.app.qos > 2 {
            return Err(anyhow!("qos must be 0, 1 or 2, got {}", inner.app.qos));
        }
        if inner.broker.host.is_empty() {
            return Err(anyhow!("broker host is empty"));
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("broker is {}:{}, server name {}", cfg.broker.host, cfg.broker.port, cfg.broker.server_name());
        log::info!(
            "keepalive {:?}, clean_session {}, max_inflight {}",
            cfg.client.keepalive,
            cfg.client.clean_session,
            cfg.client.max_inflight
        );
        log::info!("retry config is: {:?}", cfg.retry);
        log::info!("reconnect config is: {:?}", cfg.reconnect);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    #[serde(default = "Broker::host_default")]
    pub host: String,
    #[serde(default = "Broker::port_default")]
    pub port: u16,
    //Name the broker certificate is verified against, defaults to host
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for Broker {
    #[inline]
    fn default() -> Self {
        Self { host: Self::host_default(), port: Self::port_default(), server_name: None }
    }
}

impl Broker {
    fn host_default() -> String {
        "localhost".into()
    }
    fn port_default() -> u16 {
        8883
    }

    #[inline]
    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(self.host.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Client {
    #[serde(default)]
    pub client_id_prefix: String,
    #[serde(default = "Client::keepalive_default", deserialize_with = "deserialize_duration")]
    pub keepalive: Duration,
    #[serde(default = "Client::clean_session_default")]
    pub clean_session: bool,
    #[serde(default = "Client::connect_timeout_default", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(default = "Client::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
    //Bound for SUBACK / UNSUBACK
    #[serde(default = "Client::ack_timeout_default", deserialize_with = "deserialize_duration")]
    pub ack_timeout: Duration,
    #[serde(default = "Client::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    //Unacknowledged QoS 1/2 publishes allowed at once
    #[serde(default = "Client::max_inflight_default")]
    pub max_inflight: u16,
}

impl Default for Client {
    #[inline]
    fn default() -> Self {
        Self {
            client_id_prefix: String::new(),
            keepalive: Self::keepalive_default(),
            clean_session: Self::clean_session_default(),
            connect_timeout: Self::connect_timeout_default(),
            send_timeout: Self::send_timeout_default(),
            ack_timeout: Self::ack_timeout_default(),
            max_packet_size: Self::max_packet_size_default(),
            max_inflight: Self::max_inflight_default(),
        }
    }
}

impl Client {
    fn keepalive_default() -> Duration {
        Duration::from_secs(60)
    }
    fn clean_session_default() -> bool {
        true
    }
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(20)
    }
    fn send_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn ack_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from(1024 * 1024)
    }
    fn max_inflight_default() -> u16 {
        16
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Retry {
    #[serde(default = "Retry::interval_default", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    #[serde(default = "Retry::limit_default")]
    pub limit: usize,
}

impl Default for Retry {
    #[inline]
    fn default() -> Self {
        Self { interval: Self::interval_default(), limit: Self::limit_default() }
    }
}

impl Retry {
    fn interval_default() -> Duration {
        Duration::from_secs(10)
    }
    fn limit_default() -> usize {
        3
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reconnect {
    #[serde(default = "Reconnect::initial_interval_default", deserialize_with = "deserialize_duration")]
    pub initial_interval: Duration,
    #[serde(default = "Reconnect::max_interval_default", deserialize_with = "deserialize_duration")]
    pub max_interval: Duration,
    #[serde(default = "Reconnect::multiplier_default")]
    pub multiplier: f64,
    //0 disables jitter
    #[serde(default = "Reconnect::randomization_factor_default")]
    pub randomization_factor: f64,
    //0 retries forever
    #[serde(default = "Reconnect::max_attempts_default")]
    pub max_attempts: usize,
}

impl Default for Reconnect {
    #[inline]
    fn default() -> Self {
        Self {
            initial_interval: Self::initial_interval_default(),
            max_interval: Self::max_interval_default(),
            multiplier: Self::multiplier_default(),
            randomization_factor: Self::randomization_factor_default(),
            max_attempts: Self::max_attempts_default(),
        }
    }
}

impl Reconnect {
    fn initial_interval_default() -> Duration {
        Duration::from_secs(1)
    }
    fn max_interval_default() -> Duration {
        Duration::from_secs(60)
    }
    fn multiplier_default() -> f64 {
        2.0
    }
    fn randomization_factor_default() -> f64 {
        0.2
    }
    fn max_attempts_default() -> usize {
        10
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tls {
    #[serde(default, deserialize_with = "deserialize_path_option")]
    pub ca_cert: Option<String>,
    #[serde(default, deserialize_with = "deserialize_path_option")]
    pub client_cert: Option<String>,
    #[serde(default, deserialize_with = "deserialize_path_option")]
    pub client_key: Option<String>,
}

impl Tls {
    #[inline]
    pub fn ca_cert(&self) -> String {
        self.ca_cert.clone().unwrap_or_else(|| "certs/ca/ca.crt".into())
    }

    /// Configured client certificate, or `certs/clients/<role>.crt`
    #[inline]
    pub fn client_cert(&self, role: &str) -> String {
        self.client_cert.clone().unwrap_or_else(|| format!("certs/clients/{}.crt", role))
    }

    /// Configured client key, or `certs/clients/<role>.key`
    #[inline]
    pub fn client_key(&self, role: &str) -> String {
        self.client_key.clone().unwrap_or_else(|| format!("certs/clients/{}.key", role))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct App {
    #[serde(default = "App::topic_default")]
    pub topic: String,
    #[serde(default = "App::interval_default", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    #[serde(default = "App::qos_default")]
    pub qos: u8,
}

impl Default for App {
    #[inline]
    fn default() -> Self {
        Self { topic: Self::topic_default(), interval: Self::interval_default(), qos: Self::qos_default() }
    }
}

impl App {
    fn topic_default() -> String {
        "kobayashi/signals/test".into()
    }
    fn interval_default() -> Duration {
        Duration::from_secs(10)
    }
    fn qos_default() -> u8 {
        1
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(name: &str, text: &str) -> String {
        let path = std::env::temp_dir().join(format!("smqtt-conf-{}-{}.toml", name, std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Settings::new(Options::default()).unwrap();
        assert_eq!(cfg.broker.host, "localhost");
        assert_eq!(cfg.broker.port, 8883);
        assert_eq!(cfg.broker.server_name(), "localhost");
        assert_eq!(cfg.client.keepalive, Duration::from_secs(60));
        assert!(cfg.client.clean_session);
        assert_eq!(cfg.client.max_packet_size.as_u32(), 1024 * 1024);
        assert_eq!(cfg.client.max_inflight, 16);
        assert_eq!(cfg.retry.interval, Duration::from_secs(10));
        assert_eq!(cfg.retry.limit, 3);
        assert_eq!(cfg.reconnect.max_attempts, 10);
        assert_eq!(cfg.reconnect.multiplier, 2.0);
        assert_eq!(cfg.app.topic, "kobayashi/signals/test");
        assert_eq!(cfg.app.qos, 1);
        assert_eq!(cfg.tls.ca_cert(), "certs/ca/ca.crt");
        assert_eq!(cfg.tls.client_cert("publisher"), "certs/clients/publisher.crt");
        assert_eq!(cfg.tls.client_key("subscriber"), "certs/clients/subscriber.key");
    }

    #[test]
    fn test_config_file() {
        let file = write_config(
            "file",
            r#"
[broker]
host = "mqtt.example.com"
server_name = "broker"

[client]
keepalive = "10s"
clean_session = false
max_packet_size = "256K"

[retry]
interval = "500ms"
limit = 5

[reconnect]
initial_interval = "2s"
max_interval = "1m"
randomization_factor = 0.0
max_attempts = 0

[tls]
ca_cert = "/etc/ssl/ca.pem"
"#,
        );
        let cfg = Settings::new(Options { cfg_name: Some(file), ..Default::default() }).unwrap();
        assert_eq!(cfg.broker.host, "mqtt.example.com");
        assert_eq!(cfg.broker.server_name(), "broker");
        assert_eq!(cfg.client.keepalive, Duration::from_secs(10));
        assert!(!cfg.client.clean_session);
        assert_eq!(cfg.client.max_packet_size.as_u32(), 256 * 1024);
        assert_eq!(cfg.retry.interval, Duration::from_millis(500));
        assert_eq!(cfg.retry.limit, 5);
        assert_eq!(cfg.reconnect.initial_interval, Duration::from_secs(2));
        assert_eq!(cfg.reconnect.max_interval, Duration::from_secs(60));
        assert_eq!(cfg.reconnect.max_attempts, 0);
        assert_eq!(cfg.tls.ca_cert(), "/etc/ssl/ca.pem");
    }

    #[test]
    fn test_command_line_overrides() {
        let file = write_config("cli", "[broker]\nhost = \"file-broker\"\nport = 1884\n\n[app]\nqos = 0\n");
        let opts = Options {
            cfg_name: Some(file),
            broker: Some("test-broker".into()),
            topic: Some("test/topic".into()),
            interval: Some(0.25),
            qos: Some(2),
            client_cert: Some("me.crt".into()),
            debug: true,
            ..Default::default()
        };
        let cfg = Settings::new(opts).unwrap();
        assert_eq!(cfg.broker.host, "test-broker");
        assert_eq!(cfg.broker.port, 1884);
        assert_eq!(cfg.app.topic, "test/topic");
        assert_eq!(cfg.app.interval, Duration::from_millis(250));
        assert_eq!(cfg.app.qos, 2);
        assert_eq!(cfg.tls.client_cert("publisher"), "me.crt");
        assert_eq!(cfg.tls.client_key("publisher"), "certs/clients/publisher.key");
        assert_eq!(cfg.log.level.level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_invalid_values() {
        assert!(Settings::new(Options { qos: Some(3), ..Default::default() }).is_err());
        assert!(Settings::new(Options { interval: Some(0.0), ..Default::default() }).is_err());
        assert!(Settings::new(Options { cfg_name: Some("/nonexistent/smqtt.toml".into()), ..Default::default() })
            .is_err());
    }
}
