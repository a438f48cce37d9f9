use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// MQTT broker host
    #[structopt(name = "broker", long)]
    pub broker: Option<String>,

    /// MQTT broker TLS port
    #[structopt(name = "port", long)]
    pub port: Option<u16>,

    /// Topic to publish to or subscribe on
    #[structopt(name = "topic", long)]
    pub topic: Option<String>,

    /// Interval between messages in seconds, fractions allowed
    #[structopt(name = "interval", long)]
    pub interval: Option<f64>,

    /// Quality of service, 0, 1 or 2
    #[structopt(name = "qos", long)]
    pub qos: Option<u8>,

    /// CA certificate file
    #[structopt(name = "ca-cert", long)]
    pub ca_cert: Option<String>,

    /// Client certificate file
    #[structopt(name = "cert", long)]
    pub client_cert: Option<String>,

    /// Client private key file
    #[structopt(name = "key", long)]
    pub client_key: Option<String>,

    /// Client identifier, a random one is generated when absent
    #[structopt(name = "client-id", long)]
    pub client_id: Option<String>,

    /// Enable debug logging
    #[structopt(name = "debug", long)]
    pub debug: bool,
}
