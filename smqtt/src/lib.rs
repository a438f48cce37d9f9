#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use std::time::Duration;
//!
//! use smqtt::{Client, ClientOptions, Message, QoS};
//! use smqtt_net::{CertificateBundle, TlsConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bundle = CertificateBundle::from_pem_files("certs/ca.crt", "certs/client.crt", "certs/client.key")?;
//!     let connector = TlsConnector::new("broker.local", 8883, &bundle, None, Duration::from_secs(10))?;
//!
//!     let client = Client::connect(connector, ClientOptions::new("publisher-42")).await?;
//!     client.subscribe("signals/#", QoS::AtLeastOnce, |msg: &Message| println!("{:?}", msg)).await?;
//!     client.publish("signals/test", "ping", QoS::AtLeastOnce, false).await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//!
//! ```

/// Session Core
pub mod inflight; // Outbound and inbound in-flight tracking
pub mod publisher; // Outbound QoS 1/2 delivery
pub mod session; // Sans-IO MQTT session state machine
pub mod subscriber; // Subscriptions and inbound delivery
pub mod topic; // Topic names and filters

/// Connection Management
pub mod client; // Client handle and the session task
pub mod supervisor; // Reconnection backoff

/// Support
pub mod error;
pub mod logger;
pub mod options;
pub mod types;

pub use client::{Client, Connector};
pub use error::{ClientError, ProtocolError};
pub use options::{ClientOptions, ReconnectOptions};
pub use publisher::validate_publish;
pub use session::Session;
pub use supervisor::Supervisor;
pub use topic::{validate_topic_name, TopicFilter};
pub use types::{ConnectionState, LastWill, Message, MessageHandler, PublishAck, QoS};

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
