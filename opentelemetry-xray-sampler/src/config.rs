use crate::client::DEFAULT_ENDPOINT;
use crate::error::{XraySamplerError, XraySamplerResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Base URL of the X-Ray sampling API.
pub(crate) const OTEL_XRAY_SAMPLER_ENDPOINT: &str = "OTEL_XRAY_SAMPLER_ENDPOINT";
/// Delay in seconds between two rule refreshes.
pub(crate) const OTEL_XRAY_SAMPLER_RULES_INTERVAL: &str = "OTEL_XRAY_SAMPLER_RULES_INTERVAL";
/// Default delay between two rule refreshes.
pub(crate) const OTEL_XRAY_SAMPLER_RULES_INTERVAL_DEFAULT: u64 = 300;
/// Delay in seconds between two target refreshes.
pub(crate) const OTEL_XRAY_SAMPLER_TARGETS_INTERVAL: &str = "OTEL_XRAY_SAMPLER_TARGETS_INTERVAL";
/// Default delay between two target refreshes.
pub(crate) const OTEL_XRAY_SAMPLER_TARGETS_INTERVAL_DEFAULT: u64 = 10;

/// Refresh settings of the X-Ray sampler.
#[derive(Clone, Debug)]
pub struct XraySamplerConfig {
    pub(crate) endpoint: String,
    pub(crate) rule_refresh_interval: Duration,
    pub(crate) target_refresh_interval: Duration,
}

impl Default for XraySamplerConfig {
    fn default() -> Self {
        XraySamplerConfigBuilder::default().build()
    }
}

impl XraySamplerConfig {
    /// Base URL of the sampling API.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Delay between two rule refreshes.
    pub fn rule_refresh_interval(&self) -> Duration {
        self.rule_refresh_interval
    }

    /// Delay between two target refreshes.
    pub fn target_refresh_interval(&self) -> Duration {
        self.target_refresh_interval
    }

    pub(crate) fn validate(&self) -> XraySamplerResult<()> {
        if self.rule_refresh_interval.is_zero() {
            return Err(XraySamplerError::Config(
                "rule refresh interval must be greater than zero".into(),
            ));
        }
        if self.target_refresh_interval.is_zero() {
            return Err(XraySamplerError::Config(
                "target refresh interval must be greater than zero".into(),
            ));
        }

        let uri = http::Uri::from_str(&self.endpoint).map_err(|err| {
            XraySamplerError::Config(format!("invalid endpoint {:?}: {err}", self.endpoint))
        })?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(XraySamplerError::Config(format!(
                "endpoint {:?} must be an absolute URL",
                self.endpoint
            )));
        }
        Ok(())
    }
}

/// A builder for [`XraySamplerConfig`] instances.
#[derive(Debug)]
pub struct XraySamplerConfigBuilder {
    endpoint: String,
    rule_refresh_interval: Duration,
    target_refresh_interval: Duration,
}

impl Default for XraySamplerConfigBuilder {
    /// Creates a builder with the default settings, overridden by environment
    /// variables when set.
    /// The supported environment variables are:
    /// * `OTEL_XRAY_SAMPLER_ENDPOINT`
    /// * `OTEL_XRAY_SAMPLER_RULES_INTERVAL`
    /// * `OTEL_XRAY_SAMPLER_TARGETS_INTERVAL`
    fn default() -> Self {
        XraySamplerConfigBuilder {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            rule_refresh_interval: Duration::from_secs(OTEL_XRAY_SAMPLER_RULES_INTERVAL_DEFAULT),
            target_refresh_interval: Duration::from_secs(
                OTEL_XRAY_SAMPLER_TARGETS_INTERVAL_DEFAULT,
            ),
        }
        .init_from_env_vars()
    }
}

impl XraySamplerConfigBuilder {
    /// Sets the base URL of the sampling API, usually the X-Ray daemon or the
    /// collector's sampling proxy. Defaults to `http://localhost:2000`.
    pub fn with_endpoint<E: Into<String>>(mut self, endpoint: E) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the delay between two rule refreshes. Defaults to 5 minutes.
    pub fn with_rule_refresh_interval(mut self, interval: Duration) -> Self {
        self.rule_refresh_interval = interval;
        self
    }

    /// Sets the delay between two target refreshes. Defaults to 10 seconds.
    pub fn with_target_refresh_interval(mut self, interval: Duration) -> Self {
        self.target_refresh_interval = interval;
        self
    }

    /// Builds the config. Settings are validated when the sampler is built.
    pub fn build(self) -> XraySamplerConfig {
        XraySamplerConfig {
            endpoint: self.endpoint,
            rule_refresh_interval: self.rule_refresh_interval,
            target_refresh_interval: self.target_refresh_interval,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Ok(endpoint) = env::var(OTEL_XRAY_SAMPLER_ENDPOINT) {
            if !endpoint.is_empty() {
                self.endpoint = endpoint;
            }
        }

        if let Some(interval) = env::var(OTEL_XRAY_SAMPLER_RULES_INTERVAL)
            .ok()
            .and_then(|interval| u64::from_str(&interval).ok())
        {
            self.rule_refresh_interval = Duration::from_secs(interval);
        }

        if let Some(interval) = env::var(OTEL_XRAY_SAMPLER_TARGETS_INTERVAL)
            .ok()
            .and_then(|interval| u64::from_str(&interval).ok())
        {
            self.target_refresh_interval = Duration::from_secs(interval);
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: [&str; 3] = [
        OTEL_XRAY_SAMPLER_ENDPOINT,
        OTEL_XRAY_SAMPLER_RULES_INTERVAL,
        OTEL_XRAY_SAMPLER_TARGETS_INTERVAL,
    ];

    #[test]
    fn test_default_config() {
        let config = temp_env::with_vars_unset(ENV_VARS, XraySamplerConfig::default);

        assert_eq!(config.endpoint(), "http://localhost:2000");
        assert_eq!(config.rule_refresh_interval(), Duration::from_secs(300));
        assert_eq!(config.target_refresh_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_configurable_by_env_vars() {
        let env_vars = vec![
            (OTEL_XRAY_SAMPLER_ENDPOINT, Some("http://collector:2000")),
            (OTEL_XRAY_SAMPLER_RULES_INTERVAL, Some("60")),
            (OTEL_XRAY_SAMPLER_TARGETS_INTERVAL, Some("5")),
        ];

        let config = temp_env::with_vars(env_vars, XraySamplerConfig::default);

        assert_eq!(config.endpoint(), "http://collector:2000");
        assert_eq!(config.rule_refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.target_refresh_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_env_vars_are_ignored() {
        let env_vars = vec![
            (OTEL_XRAY_SAMPLER_ENDPOINT, Some("")),
            (OTEL_XRAY_SAMPLER_RULES_INTERVAL, Some("five minutes")),
            (OTEL_XRAY_SAMPLER_TARGETS_INTERVAL, Some("-1")),
        ];

        let config = temp_env::with_vars(env_vars, XraySamplerConfig::default);

        assert_eq!(config.endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.rule_refresh_interval(), Duration::from_secs(300));
        assert_eq!(config.target_refresh_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_builder_overrides_env_vars() {
        let config = temp_env::with_vars([(OTEL_XRAY_SAMPLER_RULES_INTERVAL, Some("60"))], || {
            XraySamplerConfigBuilder::default()
                .with_endpoint("http://127.0.0.1:2000")
                .with_rule_refresh_interval(Duration::from_secs(30))
                .with_target_refresh_interval(Duration::from_secs(2))
                .build()
        });

        assert_eq!(config.endpoint(), "http://127.0.0.1:2000");
        assert_eq!(config.rule_refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.target_refresh_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_validation() {
        let zero_rules = XraySamplerConfigBuilder::default()
            .with_rule_refresh_interval(Duration::ZERO)
            .build();
        assert!(matches!(
            zero_rules.validate(),
            Err(XraySamplerError::Config(_))
        ));

        let zero_targets = XraySamplerConfigBuilder::default()
            .with_target_refresh_interval(Duration::ZERO)
            .build();
        assert!(matches!(
            zero_targets.validate(),
            Err(XraySamplerError::Config(_))
        ));

        for endpoint in ["not a url", "/relative/path", "localhost"] {
            let config = XraySamplerConfigBuilder::default()
                .with_endpoint(endpoint)
                .build();
            assert!(
                matches!(config.validate(), Err(XraySamplerError::Config(_))),
                "{endpoint} should be rejected"
            );
        }
    }
}
