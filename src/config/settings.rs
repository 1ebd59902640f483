use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the broker.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
}

/// Address the listener binds to.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Operational limits of the broker.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Seconds a new connection may take to send CONNECT. 0 disables the limit.
    pub connect_timeout_secs: u64,
    pub max_connections: usize,
    /// Capacity of the message queue feeding the forwarder. Publishers wait
    /// when it is full.
    pub queue_capacity: usize,
    /// Largest remaining length accepted from a peer, in bytes.
    pub max_packet_size: usize,
}

impl BrokerSettings {
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub connect_timeout_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub max_packet_size: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
            },
            broker: BrokerSettings {
                connect_timeout_secs: 5,
                max_connections: 1000,
                queue_capacity: 1024,
                max_packet_size: 1024 * 1024,
            },
        }
    }
}

impl PartialSettings {
    /// Overlay the values present onto the defaults.
    pub fn merge_with_defaults(self) -> Settings {
        let default = Settings::default();
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                connect_timeout_secs: broker
                    .connect_timeout_secs
                    .unwrap_or(default.broker.connect_timeout_secs),
                max_connections: broker
                    .max_connections
                    .unwrap_or(default.broker.max_connections),
                queue_capacity: broker
                    .queue_capacity
                    .unwrap_or(default.broker.queue_capacity),
                max_packet_size: broker
                    .max_packet_size
                    .unwrap_or(default.broker.max_packet_size),
            },
        }
    }
}
