//! Command-line and `DISPATCH_*` environment overrides for the loaded
//! configuration. A flag wins over its environment variable.

use clap::Args;

use dispatch_core::config::{DispatchConfig, LogFormat};

#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Gateway listen address
    #[arg(long, env = "DISPATCH_GATEWAY_ADDR")]
    pub gateway_addr: Option<String>,
    /// HS256 secret for worker access tokens
    #[arg(long, env = "DISPATCH_TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: Option<String>,
    /// AMQP broker URI; the in-process broker is used when unset
    #[arg(long, env = "DISPATCH_BROKER_URL", hide_env_values = true)]
    pub broker_url: Option<String>,
    /// Log filter directives
    #[arg(long, env = "DISPATCH_LOG_FILTER")]
    pub log_filter: Option<String>,
    /// Log format: compact or json
    #[arg(long, env = "DISPATCH_LOG_FORMAT", value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,
    /// Default matching radius in kilometres
    #[arg(long, env = "DISPATCH_MATCH_RADIUS_KM")]
    pub match_radius_km: Option<f64>,
    /// Speed above which a location jump is flagged, in km/h
    #[arg(long, env = "DISPATCH_SPEED_CEILING_KMH")]
    pub speed_ceiling_kmh: Option<f64>,
    /// Seconds a driver location stays in the proximity index
    #[arg(long, env = "DISPATCH_INDEX_TTL_SECS")]
    pub index_ttl_secs: Option<u64>,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

impl Overrides {
    /// Write every value that was given into `config`.
    pub fn apply(&self, config: &mut DispatchConfig) {
        if let Some(addr) = &self.gateway_addr {
            config.gateway.addr = addr.clone();
        }
        if let Some(secret) = &self.token_secret {
            config.gateway.token_secret = Some(secret.clone());
        }
        if let Some(url) = &self.broker_url {
            config.broker.url = Some(url.clone());
        }
        if let Some(filter) = &self.log_filter {
            config.telemetry.log_filter = filter.clone();
        }
        if let Some(format) = self.log_format {
            config.telemetry.log_format = format;
        }
        if let Some(radius) = self.match_radius_km {
            config.matching.default_radius_km = radius;
        }
        if let Some(ceiling) = self.speed_ceiling_kmh {
            config.integrity.speed_ceiling_kmh = ceiling;
        }
        if let Some(ttl) = self.index_ttl_secs {
            config.index.ttl_secs = ttl;
        }
    }
}
