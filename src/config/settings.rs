use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the WebSocket adapter, the broker core and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Address the WebSocket adapter binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Constants consumed by the broker core at process start.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Origin protocol name stamped on system messages.
    pub system_name: String,
    /// Fan topic-less system messages out to every subscriber.
    pub broadcast_system_messages: bool,
    /// Keep the most recent message per topic.
    pub cache_messages: bool,
    /// Expiry applied to subscribers registered without one. `0` disables it.
    pub default_subscription_ttl_secs: u64,
    /// Expiry applied to publishers registered without one. `0` disables it.
    pub default_publisher_ttl_secs: u64,
    /// Bound of each core service's task queue.
    pub queue_capacity: usize,
    /// Period of the expired-subscription sweep.
    pub expiry_sweep_interval_ms: u64,
    /// Write the last-message cache through to a sled database at this path.
    pub cache_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub system_name: Option<String>,
    pub broadcast_system_messages: Option<bool>,
    pub cache_messages: Option<bool>,
    pub default_subscription_ttl_secs: Option<u64>,
    pub default_publisher_ttl_secs: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub expiry_sweep_interval_ms: Option<u64>,
    pub cache_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Half a year, in seconds.
pub const DEFAULT_TERMINATION_SECS: u64 = 15_552_000;

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            system_name: "Crossbar System".to_string(),
            broadcast_system_messages: false,
            cache_messages: true,
            default_subscription_ttl_secs: DEFAULT_TERMINATION_SECS,
            default_publisher_ttl_secs: DEFAULT_TERMINATION_SECS,
            queue_capacity: 1024,
            expiry_sweep_interval_ms: 1000,
            cache_path: None,
        }
    }
}

impl PartialSettings {
    /// Overlays the values present in `self` on top of `defaults`.
    pub fn merge_over(self, defaults: Settings) -> Settings {
        let server = self.server;
        let broker = self.broker;
        let logging = self.logging;
        let d = defaults;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(d.server.host),
                port: server.as_ref().and_then(|s| s.port).unwrap_or(d.server.port),
            },
            broker: BrokerSettings {
                system_name: broker
                    .as_ref()
                    .and_then(|b| b.system_name.clone())
                    .unwrap_or(d.broker.system_name),
                broadcast_system_messages: broker
                    .as_ref()
                    .and_then(|b| b.broadcast_system_messages)
                    .unwrap_or(d.broker.broadcast_system_messages),
                cache_messages: broker
                    .as_ref()
                    .and_then(|b| b.cache_messages)
                    .unwrap_or(d.broker.cache_messages),
                default_subscription_ttl_secs: broker
                    .as_ref()
                    .and_then(|b| b.default_subscription_ttl_secs)
                    .unwrap_or(d.broker.default_subscription_ttl_secs),
                default_publisher_ttl_secs: broker
                    .as_ref()
                    .and_then(|b| b.default_publisher_ttl_secs)
                    .unwrap_or(d.broker.default_publisher_ttl_secs),
                queue_capacity: broker
                    .as_ref()
                    .and_then(|b| b.queue_capacity)
                    .unwrap_or(d.broker.queue_capacity),
                expiry_sweep_interval_ms: broker
                    .as_ref()
                    .and_then(|b| b.expiry_sweep_interval_ms)
                    .unwrap_or(d.broker.expiry_sweep_interval_ms),
                cache_path: broker
                    .as_ref()
                    .and_then(|b| b.cache_path.clone())
                    .or(d.broker.cache_path),
            },
            logging: LoggingSettings {
                level: logging
                    .as_ref()
                    .and_then(|l| l.level.clone())
                    .unwrap_or(d.logging.level),
            },
        }
    }
}
