//! Process configuration: defaults overlaid by an optional JSON file.
//! Command-line and environment overrides are applied by the binary.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use h3o::Resolution;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dispatch_contract::contract::MAX_MATCH_RADIUS_KM;

use crate::channel::ReconnectPolicy;
use crate::gateway::GatewaySettings;
use crate::integrity::IntegritySettings;
use crate::matching::MatchingSettings;
use crate::spatial::GeoIndexConfig;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_GATEWAY_ADDR: &str = "127.0.0.1:7400";
const MIN_LINE_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Supported log output formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable single line output.
    #[default]
    Compact,
    /// Structured JSON for log pipelines.
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// AMQP URI. The in-process broker is used when unset.
    pub url: Option<String>,
    /// Unacknowledged deliveries a consumer may hold.
    pub prefetch: u16,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            url: None,
            prefetch: 16,
            reconnect_attempts: policy.max_attempts,
            reconnect_base_delay_ms: duration_ms(policy.base_delay),
            reconnect_max_delay_ms: duration_ms(policy.max_delay),
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    pub ttl_secs: u64,
    pub h3_resolution: u8,
    /// How often the runtime purges expired entries.
    pub purge_interval_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let defaults = GeoIndexConfig::default();
        Self {
            ttl_secs: defaults.entry_ttl.as_secs(),
            h3_resolution: u8::from(defaults.resolution),
            purge_interval_secs: 60,
        }
    }
}

impl IndexConfig {
    pub fn geo_index_config(&self) -> Result<GeoIndexConfig, ConfigError> {
        let resolution = Resolution::try_from(self.h3_resolution).map_err(|_| {
            ConfigError::Invalid(format!("h3_resolution {} is out of range", self.h3_resolution))
        })?;
        Ok(GeoIndexConfig {
            resolution,
            entry_ttl: Duration::from_secs(self.ttl_secs),
        })
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    pub default_radius_km: f64,
    pub radius_cap_km: f64,
    pub candidate_limit: usize,
    /// Competing consumers on the matching queue within this process.
    pub consumers: usize,
    /// A claim with no completion or cancellation is dropped after this long.
    pub claim_ttl_secs: u64,
    /// How long a settled request is remembered to absorb late duplicates.
    pub settled_retention_secs: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        let defaults = MatchingSettings::default();
        Self {
            default_radius_km: defaults.default_radius_km,
            radius_cap_km: defaults.radius_cap_km,
            candidate_limit: defaults.candidate_limit,
            consumers: 1,
            claim_ttl_secs: 4 * 60 * 60,
            settled_retention_secs: 60 * 60,
        }
    }
}

impl MatchingConfig {
    pub fn settings(&self) -> MatchingSettings {
        MatchingSettings {
            default_radius_km: self.default_radius_km,
            radius_cap_km: self.radius_cap_km,
            candidate_limit: self.candidate_limit,
        }
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn settled_retention(&self) -> Duration {
        Duration::from_secs(self.settled_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub addr: String,
    /// Names this instance's relay queue on the tracking fanout.
    pub instance_id: String,
    /// HS256 secret for worker access tokens. JWTs are refused when unset.
    pub token_secret: Option<String>,
    /// Fixed `token -> worker id` table checked before JWTs.
    pub static_tokens: HashMap<String, String>,
    pub outbound_capacity: usize,
    pub auth_timeout_secs: u64,
    pub max_line_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let defaults = GatewaySettings::default();
        Self {
            addr: DEFAULT_GATEWAY_ADDR.to_string(),
            instance_id: "gateway-1".to_string(),
            token_secret: None,
            static_tokens: HashMap::new(),
            outbound_capacity: defaults.outbound_capacity,
            auth_timeout_secs: defaults.auth_timeout.as_secs(),
            max_line_bytes: defaults.max_line_bytes,
        }
    }
}

impl GatewayConfig {
    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings {
            outbound_capacity: self.outbound_capacity,
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            max_line_bytes: self.max_line_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegrityConfig {
    pub speed_ceiling_kmh: f64,
    pub prior_ttl_secs: u64,
    pub trust_penalty: u32,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        let defaults = IntegritySettings::default();
        Self {
            speed_ceiling_kmh: defaults.speed_ceiling_kmh,
            prior_ttl_secs: defaults.prior_ttl.as_secs(),
            trust_penalty: defaults.trust_penalty,
        }
    }
}

impl IntegrityConfig {
    pub fn settings(&self) -> IntegritySettings {
        IntegritySettings {
            speed_ceiling_kmh: self.speed_ceiling_kmh,
            prior_ttl: Duration::from_secs(self.prior_ttl_secs),
            trust_penalty: self.trust_penalty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub broker: BrokerConfig,
    pub index: IndexConfig,
    pub matching: MatchingConfig,
    pub gateway: GatewayConfig,
    pub integrity: IntegrityConfig,
    pub telemetry: TelemetryConfig,
}

impl DispatchConfig {
    /// Defaults, overlaid by `path` when given. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON file. Missing sections and fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.reconnect_attempts == 0 {
            return Err(invalid("broker.reconnect_attempts must be at least 1"));
        }
        if self.broker.reconnect_base_delay_ms > self.broker.reconnect_max_delay_ms {
            return Err(invalid("broker.reconnect_base_delay_ms exceeds reconnect_max_delay_ms"));
        }
        if self.broker.url.as_deref().is_some_and(|url| url.trim().is_empty()) {
            return Err(invalid("broker.url must not be empty"));
        }
        if self.broker.prefetch == 0 {
            return Err(invalid("broker.prefetch must be at least 1"));
        }
        self.index.geo_index_config()?;
        if self.index.ttl_secs == 0 {
            return Err(invalid("index.ttl_secs must be positive"));
        }
        if self.index.purge_interval_secs == 0 {
            return Err(invalid("index.purge_interval_secs must be positive"));
        }
        if !positive(self.matching.radius_cap_km) || self.matching.radius_cap_km > MAX_MATCH_RADIUS_KM
        {
            return Err(invalid(format!(
                "matching.radius_cap_km must be in (0, {MAX_MATCH_RADIUS_KM}]"
            )));
        }
        if !positive(self.matching.default_radius_km)
            || self.matching.default_radius_km > self.matching.radius_cap_km
        {
            return Err(invalid("matching.default_radius_km must be in (0, radius_cap_km]"));
        }
        if self.matching.candidate_limit == 0 || self.matching.consumers == 0 {
            return Err(invalid("matching.candidate_limit and consumers must be at least 1"));
        }
        if self.matching.claim_ttl_secs == 0 || self.matching.settled_retention_secs == 0 {
            return Err(invalid("matching.claim_ttl_secs and settled_retention_secs must be positive"));
        }
        if self.gateway.addr.trim().is_empty() || self.gateway.instance_id.trim().is_empty() {
            return Err(invalid("gateway.addr and gateway.instance_id must be set"));
        }
        if self.gateway.outbound_capacity == 0 || self.gateway.auth_timeout_secs == 0 {
            return Err(invalid("gateway.outbound_capacity and auth_timeout_secs must be positive"));
        }
        if self.gateway.max_line_bytes < MIN_LINE_BYTES {
            return Err(invalid(format!(
                "gateway.max_line_bytes must be at least {MIN_LINE_BYTES}"
            )));
        }
        if self.gateway.token_secret.as_deref().is_some_and(str::is_empty) {
            return Err(invalid("gateway.token_secret must not be empty"));
        }
        if !positive(self.integrity.speed_ceiling_kmh) {
            return Err(invalid("integrity.speed_ceiling_kmh must be positive"));
        }
        if self.integrity.prior_ttl_secs == 0 {
            return Err(invalid("integrity.prior_ttl_secs must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use dispatch_contract::contract::DEFAULT_MATCH_RADIUS_KM;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DispatchConfig::default();

        config.validate().expect("defaults validate");
        assert_eq!(config.matching.default_radius_km, DEFAULT_MATCH_RADIUS_KM);
        assert_eq!(config.index.ttl_secs, 300);
        assert_eq!(config.index.h3_resolution, 8);
        assert_eq!(config.integrity.speed_ceiling_kmh, 200.0);
        assert_eq!(config.broker.reconnect_policy(), ReconnectPolicy::default());
    }

    #[test]
    fn file_overrides_only_named_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"matching": {{"candidate_limit": 5}}, "telemetry": {{"log_format": "json"}}}}"#
        )
        .expect("write config");

        let config = DispatchConfig::from_file(file.path()).expect("parses");

        assert_eq!(config.matching.candidate_limit, 5);
        assert_eq!(config.matching.default_radius_km, DEFAULT_MATCH_RADIUS_KM);
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
        assert_eq!(config.gateway, GatewayConfig::default());
    }

    #[test]
    fn unknown_fields_are_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"matching": {{"radius": 5}}}}"#).expect("write config");

        let err = DispatchConfig::from_file(file.path()).expect_err("unknown field");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn broker_url_and_ledger_windows_come_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"broker": {{"url": "amqp://localhost:5672/%2f", "prefetch": 4}},
                "matching": {{"claim_ttl_secs": 600}}}}"#
        )
        .expect("write config");

        let config = DispatchConfig::load(Some(file.path())).expect("loads");

        assert_eq!(config.broker.url.as_deref(), Some("amqp://localhost:5672/%2f"));
        assert_eq!(config.broker.prefetch, 4);
        assert_eq!(config.matching.claim_ttl(), Duration::from_secs(600));
        assert_eq!(config.matching.settled_retention(), Duration::from_secs(3600));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let cases: Vec<fn(&mut DispatchConfig)> = vec![
            |c| c.broker.reconnect_attempts = 0,
            |c| c.index.h3_resolution = 16,
            |c| c.index.ttl_secs = 0,
            |c| c.matching.default_radius_km = 0.0,
            |c| c.matching.default_radius_km = c.matching.radius_cap_km + 1.0,
            |c| c.integrity.speed_ceiling_kmh = -1.0,
            |c| c.gateway.token_secret = Some(String::new()),
            |c| c.gateway.max_line_bytes = 16,
            |c| c.broker.url = Some(" ".to_string()),
            |c| c.broker.prefetch = 0,
            |c| c.matching.claim_ttl_secs = 0,
        ];

        for mutate in cases {
            let mut config = DispatchConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }
}
