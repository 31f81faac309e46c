use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::proto;

/// Top-level broker configuration, loaded from a YAML file.
///
/// Every section (and every field) falls back to a default, so a partial
/// config file is fine and an absent section means "defaults".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    server: ServerSettings,
    tls: TlsSettings,
    auth: AuthSettings,
    storage: StorageSettings,
    limits: LimitsSettings,
    qos: QosSettings,
    logging: LoggingSettings,
    metrics: MetricsSettings,
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn server(&self) -> &ServerSettings {
        &self.server
    }

    pub fn tls(&self) -> &TlsSettings {
        &self.tls
    }

    pub fn auth(&self) -> &AuthSettings {
        &self.auth
    }

    pub fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub fn limits(&self) -> &LimitsSettings {
        &self.limits
    }

    pub fn qos(&self) -> &QosSettings {
        &self.qos
    }

    pub fn logging(&self) -> &LoggingSettings {
        &self.logging
    }

    pub fn metrics(&self) -> &MetricsSettings {
        &self.metrics
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.server.port == 0 {
            return Err(SettingsError::Invalid(
                "invalid port: 0 (must be 1-65535)".into(),
            ));
        }

        if self.tls.enabled && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
            return Err(SettingsError::Invalid(
                "tls enabled but cert_file or key_file not specified".into(),
            ));
        }

        if self.qos.max_qos > 2 {
            return Err(SettingsError::Invalid(format!(
                "invalid max_qos: {} (must be 0, 1, or 2)",
                self.qos.max_qos
            )));
        }

        match self.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => (),
            level => {
                return Err(SettingsError::Invalid(format!(
                    "invalid log level: {} (must be debug, info, warn, or error)",
                    level
                )));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(SettingsError::Invalid(
                    "invalid metrics port: 0 (must be 1-65535)".into(),
                ));
            }
            if self.metrics.port == self.server.port {
                return Err(SettingsError::Invalid(
                    "metrics port cannot be the same as server port".into(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("unable to load configuration")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerSettings {
    host: String,
    port: u16,
    #[serde(with = "humantime_serde")]
    keep_alive: Duration,
    #[serde(with = "humantime_serde")]
    write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    read_timeout: Duration,
    clean_session_default: bool,
}

impl ServerSettings {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn clean_session_default(&self) -> bool {
        self.clean_session_default
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            keep_alive: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            clean_session_default: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TlsSettings {
    enabled: bool,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    ca_file: Option<PathBuf>,
}

impl TlsSettings {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    pub fn ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AuthSettings {
    enabled: bool,
    allow_anonymous: bool,
    require_client_certs: bool,
    username_password_file: Option<PathBuf>,
}

impl AuthSettings {
    pub fn new(
        enabled: bool,
        allow_anonymous: bool,
        require_client_certs: bool,
        username_password_file: Option<PathBuf>,
    ) -> Self {
        Self {
            enabled,
            allow_anonymous,
            require_client_certs,
            username_password_file,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    pub fn require_client_certs(&self) -> bool {
        self.require_client_certs
    }

    pub fn username_password_file(&self) -> Option<&Path> {
        self.username_password_file.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StorageSettings {
    backend: StorageBackend,
    path: PathBuf,
}

impl StorageSettings {
    pub fn backend(&self) -> StorageBackend {
        self.backend
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("./data/stratus.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LimitsSettings {
    max_clients: usize,
    max_message_size: usize,
    max_inflight_messages: usize,
    retained_messages: bool,
}

impl LimitsSettings {
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn max_inflight_messages(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_inflight_messages)
    }

    pub fn retained_messages(&self) -> bool {
        self.retained_messages
    }
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            max_clients: 1000,
            max_message_size: 256 * 1024,
            max_inflight_messages: 100,
            retained_messages: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct QosSettings {
    max_qos: u8,
    #[serde(with = "humantime_serde")]
    retry_interval: Duration,
    max_retries: u32,
}

impl QosSettings {
    pub fn max_qos(&self) -> u8 {
        self.max_qos
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for QosSettings {
    fn default() -> Self {
        Self {
            max_qos: 1,
            retry_interval: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LoggingSettings {
    level: String,
    format: String,
    output: String,
}

impl LoggingSettings {
    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stdout".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MetricsSettings {
    enabled: bool,
    port: u16,
    path: String,
}

impl MetricsSettings {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".into(),
        }
    }
}

/// The subset of the settings the broker loop itself needs.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    max_clients: usize,
    max_inflight_messages: Option<NonZeroUsize>,
    retained_messages: bool,
    max_qos: proto::QoS,
    retry_interval: Duration,
    max_retries: u32,
}

impl BrokerConfig {
    pub fn new(
        max_clients: usize,
        max_inflight_messages: usize,
        retained_messages: bool,
        max_qos: u8,
        retry_interval: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            max_clients,
            max_inflight_messages: NonZeroUsize::new(max_inflight_messages),
            retained_messages,
            max_qos: qos_from_level(max_qos),
            retry_interval,
            max_retries,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn max_inflight_messages(&self) -> Option<NonZeroUsize> {
        self.max_inflight_messages
    }

    pub fn retained_messages(&self) -> bool {
        self.retained_messages
    }

    /// The highest QoS the broker grants on SUBSCRIBE. Capped at QoS 1; the
    /// exactly-once flow is not implemented.
    pub fn granted_qos_cap(&self) -> proto::QoS {
        std::cmp::min(self.max_qos, proto::QoS::AtLeastOnce)
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig::from(&Settings::default())
    }
}

impl From<&Settings> for BrokerConfig {
    fn from(settings: &Settings) -> Self {
        BrokerConfig::new(
            settings.limits.max_clients,
            settings.limits.max_inflight_messages,
            settings.limits.retained_messages,
            settings.qos.max_qos,
            settings.qos.retry_interval,
            settings.qos.max_retries,
        )
    }
}

fn qos_from_level(level: u8) -> proto::QoS {
    match level {
        0 => proto::QoS::AtMostOnce,
        1 => proto::QoS::AtLeastOnce,
        _ => proto::QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use matches::assert_matches;

    use super::*;

    #[test]
    fn it_loads_defaults() {
        let settings = Settings::default();

        assert_eq!(settings.server().host(), "127.0.0.1");
        assert_eq!(settings.server().port(), 1883);
        assert_eq!(settings.server().keep_alive(), Duration::from_secs(60));
        assert_eq!(settings.server().write_timeout(), Duration::from_secs(10));
        assert_eq!(settings.server().read_timeout(), Duration::from_secs(30));
        assert!(!settings.tls().enabled());
        assert!(!settings.auth().enabled());
        assert_eq!(settings.storage().backend(), StorageBackend::Memory);
        assert_eq!(settings.limits().max_clients(), 1000);
        assert_eq!(settings.limits().max_message_size(), 256 * 1024);
        assert_eq!(
            settings.limits().max_inflight_messages(),
            NonZeroUsize::new(100)
        );
        assert!(settings.limits().retained_messages());
        assert_eq!(settings.qos().max_qos(), 1);
        assert_eq!(settings.qos().retry_interval(), Duration::from_secs(10));
        assert_eq!(settings.qos().max_retries(), 3);
        assert_eq!(settings.logging().level(), "info");
        assert!(!settings.metrics().enabled());
        assert_eq!(settings.metrics().port(), 9090);
        assert_eq!(settings.metrics().path(), "/metrics");

        settings.validate().unwrap();
    }

    #[test]
    fn it_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(
            br#"
server:
  host: 0.0.0.0
  port: 2883
  keep_alive: 30s
storage:
  backend: sled
  path: /tmp/test.db
limits:
  max_clients: 5
qos:
  retry_interval: 2s
"#,
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();

        assert_eq!(settings.server().host(), "0.0.0.0");
        assert_eq!(settings.server().port(), 2883);
        assert_eq!(settings.server().keep_alive(), Duration::from_secs(30));
        assert_eq!(settings.storage().backend(), StorageBackend::Sled);
        assert_eq!(settings.limits().max_clients(), 5);
        assert_eq!(settings.qos().retry_interval(), Duration::from_secs(2));

        // untouched sections keep their defaults
        assert_eq!(settings.server().write_timeout(), Duration::from_secs(10));
        assert_eq!(settings.qos().max_retries(), 3);
    }

    #[test]
    fn it_rejects_tls_without_cert() {
        let mut settings = Settings::default();
        settings.tls.enabled = true;
        assert_matches!(settings.validate(), Err(SettingsError::Invalid(_)));
    }

    #[test]
    fn it_rejects_bad_max_qos() {
        let mut settings = Settings::default();
        settings.qos.max_qos = 3;
        assert_matches!(settings.validate(), Err(SettingsError::Invalid(_)));
    }

    #[test]
    fn it_rejects_bad_log_level() {
        let mut settings = Settings::default();
        settings.logging.level = "verbose".into();
        assert_matches!(settings.validate(), Err(SettingsError::Invalid(_)));
    }

    #[test]
    fn it_rejects_metrics_port_clash() {
        let mut settings = Settings::default();
        settings.metrics.enabled = true;
        settings.metrics.port = settings.server.port;
        assert_matches!(settings.validate(), Err(SettingsError::Invalid(_)));
    }

    #[test]
    fn granted_qos_is_capped_at_qos1() {
        let config = BrokerConfig::new(10, 10, true, 2, Duration::from_secs(10), 3);
        assert_eq!(config.granted_qos_cap(), proto::QoS::AtLeastOnce);

        let config = BrokerConfig::new(10, 10, true, 0, Duration::from_secs(10), 3);
        assert_eq!(config.granted_qos_cap(), proto::QoS::AtMostOnce);
    }
}
