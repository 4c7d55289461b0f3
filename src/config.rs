use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::delivery::EventCallback;
use crate::event::ChangeEvent;
use crate::filter::TableFilter;
use crate::transform::Transformation;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub delivery: Vec<DeliveryConfig>,
    #[serde(default)]
    pub tables: TableFilter,
    #[serde(default)]
    pub batching: BatchConfig,
    /// Code-only; applied in order to every event whose table matches.
    #[serde(skip)]
    pub transformations: Vec<Transformation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    #[serde(alias = "postgresql")]
    Postgres,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default)]
    pub kind: DatabaseType,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,
}

/// How events leave the process. `websocket` and `webhook` are recognized
/// but rejected when sinks are built.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum DeliveryConfig {
    Sse(SseOptions),
    Callback(CallbackOptions),
    #[serde(alias = "socket")]
    WebSocket(RawOptions),
    Webhook(RawOptions),
}

pub type RawOptions = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Deserialize)]
pub struct SseOptions {
    /// Milliseconds between heartbeat comments; zero or negative disables.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: i64,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl SseOptions {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        u64::try_from(self.heartbeat_interval_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackOptions {
    #[serde(skip)]
    pub handler: Option<EventCallback>,
}

impl DeliveryConfig {
    pub fn sse() -> Self {
        DeliveryConfig::Sse(SseOptions::default())
    }

    pub fn callback(handler: EventCallback) -> Self {
        DeliveryConfig::Callback(CallbackOptions {
            handler: Some(handler),
        })
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            DeliveryConfig::Sse(_) => "sse",
            DeliveryConfig::Callback(_) => "callback",
            DeliveryConfig::WebSocket(_) => "websocket",
            DeliveryConfig::Webhook(_) => "webhook",
        }
    }
}

impl Config {
    pub fn new(database: DatabaseConfig) -> Self {
        Self {
            database,
            delivery: Vec::new(),
            tables: TableFilter::default(),
            batching: BatchConfig::default(),
            transformations: Vec::new(),
        }
    }

    /// Loads a config file (format from extension), with `PG_NOTIFIER_*`
    /// environment overrides, e.g. `PG_NOTIFIER_DATABASE__HOST`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_NOTIFIER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery.push(delivery);
        self
    }

    /// Adds a callback delivery invoking `handler` once per event.
    pub fn with_callback<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.with_delivery(DeliveryConfig::callback(EventCallback::new(handler)))
    }

    /// Attaches `handler` to every configured callback delivery that has
    /// none yet. Used when the deliveries come from a file.
    pub fn attach_callback(&mut self, handler: EventCallback) -> usize {
        let mut attached = 0;
        for delivery in &mut self.delivery {
            if let DeliveryConfig::Callback(options) = delivery {
                if options.handler.is_none() {
                    options.handler = Some(handler.clone());
                    attached += 1;
                }
            }
        }
        attached
    }

    pub fn with_tables(mut self, tables: TableFilter) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_batching(mut self, batching: BatchConfig) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformations.push(transformation);
        self
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.database.host.trim().is_empty() {
            return Err(Error::Config("database.host is required".to_string()));
        }
        if self.database.database.trim().is_empty() {
            return Err(Error::Config("database.database is required".to_string()));
        }
        if self.database.pool_max_size == 0 {
            return Err(Error::Config(
                "database.pool_max_size must be positive".to_string(),
            ));
        }
        if self.delivery.is_empty() {
            return Err(Error::Config(
                "At least one delivery method must be configured".to_string(),
            ));
        }
        for (index, delivery) in self.delivery.iter().enumerate() {
            if let DeliveryConfig::Callback(options) = delivery {
                if options.handler.is_none() {
                    return Err(Error::Config(format!(
                        "delivery[{}]: callback delivery requires a handler",
                        index
                    )));
                }
            }
        }
        if self.batching.enabled {
            if self.batching.size == 0 {
                return Err(Error::Config("batching.size must be positive".to_string()));
            }
            if self.batching.window_ms == 0 {
                return Err(Error::Config(
                    "batching.window_ms must be positive".to_string(),
                ));
            }
        }
        if self.tables.schemas.is_empty() {
            return Err(Error::Config(
                "tables.schemas must list at least one schema".to_string(),
            ));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            kind: DatabaseType::Postgres,
            host: host.into(),
            port: default_port(),
            database: database.into(),
            username: username.into(),
            password: password.into(),
            connect_timeout_secs: default_connect_timeout(),
            pool_max_size: default_pool_max_size(),
        }
    }

    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .application_name("pg-change-notifier")
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_pool_max_size() -> usize {
    4
}

fn default_heartbeat_interval_ms() -> i64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn database() -> DatabaseConfig {
        DatabaseConfig::new("localhost", "app", "postgres", "secret")
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[database]
type = "postgres"
host = "db.internal"
database = "app"
username = "notifier"

[tables]
include = ["users"]

[batching]
enabled = true
size = 10

[[delivery]]
method = "sse"
heartbeat_interval_ms = 0

[[delivery]]
method = "callback"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.tables.schemas, vec!["public"]);
        assert_eq!(config.batching.size, 10);
        assert_eq!(config.batching.window_ms, 1000);
        assert_eq!(config.delivery.len(), 2);
        match &config.delivery[0] {
            DeliveryConfig::Sse(options) => assert!(options.heartbeat_interval().is_none()),
            other => panic!("unexpected delivery {:?}", other),
        }
        // callback handlers never come from files
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_attach_callback() {
        let mut config = Config::new(database())
            .with_delivery(DeliveryConfig::Callback(CallbackOptions::default()));
        let attached = config.attach_callback(EventCallback::new(|_| async { Ok(()) }));

        assert_eq!(attached, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation() {
        let base = || Config::new(database()).with_delivery(DeliveryConfig::sse());
        base().validate().unwrap();

        assert!(Config::new(database()).validate().is_err());

        let mut config = base();
        config.batching = BatchConfig::enabled(0, Duration::from_secs(1));
        assert!(config.validate().is_err());

        let mut config = base();
        config.batching = BatchConfig::enabled(5, Duration::ZERO);
        assert!(config.validate().is_err());

        let mut config = base();
        config.database.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_methods_parse() {
        let delivery: DeliveryConfig =
            serde_json::from_str(r#"{"method": "webhook", "url": "http://x"}"#).unwrap();
        assert_eq!(delivery.method_name(), "webhook");

        let delivery: DeliveryConfig = serde_json::from_str(r#"{"method": "socket"}"#).unwrap();
        assert_eq!(delivery.method_name(), "websocket");

        assert!(serde_json::from_str::<DeliveryConfig>(r#"{"method": "carrier-pigeon"}"#).is_err());
    }

    #[test]
    fn test_heartbeat_interval() {
        let options = SseOptions::default();
        assert_eq!(options.heartbeat_interval(), Some(Duration::from_secs(30)));
        let options = SseOptions {
            heartbeat_interval_ms: -5,
        };
        assert!(options.heartbeat_interval().is_none());
    }
}
