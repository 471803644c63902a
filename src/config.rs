//! Client configuration.
//!
//! Enumerates every knob the session engine consumes. No loader or file
//! format is shipped; the struct derives `Deserialize` so embedding
//! applications can source it from whatever configuration layer they
//! already have.

use crate::client::reconnect::{ExponentialBackoff, ReconnectStrategy};
use crate::codec::packet::Qos;
use crate::codec::properties::Properties;
use crate::error::MqttError;
use crate::net::tls::TlsConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Will message registered at CONNECT time and published by the broker
/// on an ungraceful disconnect.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WillConfig {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    /// Will properties (delay interval, message expiry, content type, ...).
    #[serde(skip)]
    pub properties: Properties,
}

/// Options consumed by [`MqttClient`](crate::client::MqttClient).
///
/// All durations are in seconds, matching their wire representation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker hostname or IP address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier; empty lets the server assign one.
    pub client_id: String,
    /// CONNECT clean-start flag.
    pub clean_start: bool,
    /// CONNECT keep-alive in seconds; 0 disables keep-alive.
    pub keep_alive_secs: u16,
    /// Session expiry interval; 0xFFFF_FFFF means the session never
    /// expires.
    pub session_expiry_interval: u32,
    /// Maximum number of concurrent inbound QoS 1/2 publishes we accept.
    pub receive_maximum: u16,
    /// Largest packet we accept; 0 means no limit.
    pub maximum_packet_size: u32,
    /// Maximum inbound topic alias we accept; 0 disables inbound
    /// aliasing.
    pub topic_alias_maximum: u16,
    pub request_response_information: bool,
    pub request_problem_information: bool,
    /// User properties attached to the CONNECT.
    pub user_properties: Vec<(String, String)>,
    /// Enhanced authentication method; enables the AUTH exchange.
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    /// Wrap the TCP stream in TLS.
    pub use_tls: bool,
    /// TLS configuration; required when `use_tls` is set unless the
    /// defaults (system roots, SNI = host) are acceptable.
    #[serde(skip)]
    pub tls: Option<TlsConfig>,
    /// Will message registered with the broker.
    pub will: Option<WillConfig>,
    /// Abort a CONNECT that has not completed within this many seconds.
    pub connect_timeout_secs: u64,
    /// Reconnect automatically on unexpected connection loss and queue
    /// publishes issued while offline.
    pub auto_reconnect: bool,
    /// Explicit reconnect schedule; takes precedence over the legacy
    /// delay knobs below.
    #[serde(skip)]
    pub reconnect_strategy: Option<Arc<dyn ReconnectStrategy>>,
    /// Legacy knob: initial reconnect delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Legacy knob: cap on the reconnect delay in seconds.
    pub max_reconnect_delay_secs: u64,
    /// Legacy knob: reconnect attempt limit; 0 means unlimited.
    pub max_reconnect_attempts: u32,
    /// Offline publish queue capacity; 0 means unlimited.
    pub offline_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: String::new(),
            clean_start: true,
            keep_alive_secs: 60,
            session_expiry_interval: 0,
            receive_maximum: 65_535,
            maximum_packet_size: 0,
            topic_alias_maximum: 0,
            request_response_information: false,
            request_problem_information: true,
            user_properties: Vec::new(),
            authentication_method: None,
            authentication_data: None,
            username: None,
            password: None,
            use_tls: false,
            tls: None,
            will: None,
            connect_timeout_secs: 30,
            auto_reconnect: false,
            reconnect_strategy: None,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 60,
            max_reconnect_attempts: 0,
            offline_queue_capacity: 100,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The reconnect schedule in effect: the explicit strategy when one
    /// is set, otherwise exponential backoff synthesized from the legacy
    /// knobs.
    pub fn effective_reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy> {
        if let Some(strategy) = &self.reconnect_strategy {
            return Arc::clone(strategy);
        }
        Arc::new(
            ExponentialBackoff::new(
                Duration::from_secs(self.reconnect_delay_secs.max(1)),
                Duration::from_secs(
                    self.max_reconnect_delay_secs
                        .max(self.reconnect_delay_secs.max(1)),
                ),
            )
            .with_max_attempts(self.max_reconnect_attempts),
        )
    }

    /// Reject configurations the engine cannot act on.
    pub fn validate(&self) -> Result<(), MqttError> {
        if self.host.is_empty() {
            return Err(MqttError::IllegalState("host is not configured".into()));
        }
        if self.port == 0 {
            return Err(MqttError::IllegalState("port is not configured".into()));
        }
        if self.authentication_data.is_some() && self.authentication_method.is_none() {
            return Err(MqttError::IllegalState(
                "authentication data without authentication method".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert!(config.client_id.is_empty());
        assert!(config.clean_start);
        assert_eq!(config.keep_alive_secs, 60);
        assert_eq!(config.receive_maximum, 65_535);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert!(!config.auto_reconnect);
        assert_eq!(config.offline_queue_capacity, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_legacy_knobs_synthesize_exponential_backoff() {
        let config = ClientConfig {
            reconnect_delay_secs: 2,
            max_reconnect_delay_secs: 16,
            max_reconnect_attempts: 3,
            ..Default::default()
        };
        let strategy = config.effective_reconnect_strategy();
        let cause = MqttError::Connection("lost".into());
        assert_eq!(
            strategy.next_delay(1, &cause),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            strategy.next_delay(3, &cause),
            Some(Duration::from_secs(8))
        );
        assert_eq!(strategy.next_delay(4, &cause), None);
    }

    #[test]
    fn test_explicit_strategy_takes_precedence() {
        let config = ClientConfig {
            reconnect_strategy: Some(Arc::new(
                crate::client::reconnect::ConstantDelay::new(Duration::from_millis(50)),
            )),
            reconnect_delay_secs: 9,
            ..Default::default()
        };
        let cause = MqttError::Connection("lost".into());
        assert_eq!(
            config.effective_reconnect_strategy().next_delay(10, &cause),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_validation_rejects_incomplete_config() {
        let config = ClientConfig {
            host: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MqttError::IllegalState(_))
        ));

        let config = ClientConfig {
            authentication_data: Some(b"blob".to_vec()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_document() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"host": "broker.example.com", "port": 8883, "use_tls": true}"#,
        )
        .unwrap();
        assert_eq!(config.host, "broker.example.com");
        assert_eq!(config.port, 8883);
        assert!(config.use_tls);
        assert_eq!(config.keep_alive_secs, 60);
    }
}
