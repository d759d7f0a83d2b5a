//! Controller configuration read from `KVELA_*` environment variables

use std::time::Duration;
use tracing::warn;

/// Default port for health and metrics endpoints
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Longest single delay of a [`Backoff`]
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(30);

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Backoff {
    /// Delays between attempts; `steps` attempts have `steps - 1` delays
    ///
    /// Each delay is capped at [`MAX_BACKOFF_DELAY`].
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.steps).map(move |i| {
            let exponent = i32::try_from(i - 1).unwrap_or(i32::MAX);
            let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
            Duration::try_from_secs_f64(secs)
                .unwrap_or(MAX_BACKOFF_DELAY)
                .min(MAX_BACKOFF_DELAY)
        })
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2.0,
            steps: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Deadline of a single reconciliation pass
    pub reconcile_timeout: Duration,
    /// Polling of a freshly dispatched workload
    pub verify_backoff: Backoff,
    /// Attempts of a conflicting status write
    pub status_retries: usize,
    pub health_port: u16,
    /// Watch a single namespace instead of the whole cluster
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(60),
            verify_backoff: Backoff::default(),
            status_retries: 5,
            health_port: DEFAULT_HEALTH_PORT,
            namespace: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unparsable values fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = parse_or(&lookup, "KVELA_RECONCILE_TIMEOUT_SECS", 60u64);
        let backoff_ms = parse_or(&lookup, "KVELA_VERIFY_BACKOFF_MS", 500u64);
        let factor = parse_or(&lookup, "KVELA_VERIFY_BACKOFF_FACTOR", defaults.verify_backoff.factor);
        let factor = if factor.is_finite() {
            factor.max(1.0)
        } else {
            warn!(variable = "KVELA_VERIFY_BACKOFF_FACTOR", value = factor, "Ignoring non-finite backoff factor");
            defaults.verify_backoff.factor
        };

        Self {
            reconcile_timeout: Duration::from_secs(secs.max(1)),
            verify_backoff: Backoff {
                initial: Duration::from_millis(backoff_ms),
                factor,
                steps: parse_or(&lookup, "KVELA_VERIFY_BACKOFF_STEPS", defaults.verify_backoff.steps)
                    .max(1),
            },
            status_retries: parse_or(&lookup, "KVELA_STATUS_RETRIES", defaults.status_retries).max(1),
            health_port: parse_or(&lookup, "KVELA_HEALTH_PORT", defaults.health_port),
            namespace: lookup("KVELA_NAMESPACE").filter(|ns| !ns.is_empty()),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = key, value = %raw, "Ignoring unparsable configuration value");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = ControllerConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.reconcile_timeout, Duration::from_secs(60));
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn test_reads_variables() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("KVELA_RECONCILE_TIMEOUT_SECS", "30"),
            ("KVELA_VERIFY_BACKOFF_MS", "100"),
            ("KVELA_VERIFY_BACKOFF_STEPS", "3"),
            ("KVELA_STATUS_RETRIES", "2"),
            ("KVELA_HEALTH_PORT", "9090"),
            ("KVELA_NAMESPACE", "apps"),
        ]));

        assert_eq!(config.reconcile_timeout, Duration::from_secs(30));
        assert_eq!(config.verify_backoff.initial, Duration::from_millis(100));
        assert_eq!(config.verify_backoff.steps, 3);
        assert_eq!(config.status_retries, 2);
        assert_eq!(config.health_port, 9090);
        assert_eq!(config.namespace.as_deref(), Some("apps"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("KVELA_HEALTH_PORT", "not-a-port"),
            ("KVELA_STATUS_RETRIES", "0"),
            ("KVELA_NAMESPACE", ""),
        ]));

        assert_eq!(config.health_port, 8080);
        assert_eq!(config.status_retries, 1);
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn test_non_finite_backoff_factor_falls_back() {
        for raw in ["inf", "-inf", "NaN"] {
            let config =
                ControllerConfig::from_lookup(lookup(&[("KVELA_VERIFY_BACKOFF_FACTOR", raw)]));
            assert_eq!(config.verify_backoff.factor, 2.0, "factor {}", raw);
        }
    }

    #[test]
    fn test_backoff_delays_are_capped() {
        let backoff = Backoff {
            initial: Duration::from_millis(500),
            factor: f64::INFINITY,
            steps: 3,
        };
        let delays: Vec<_> = backoff.delays().collect();
        assert_eq!(delays, vec![Duration::from_millis(500), MAX_BACKOFF_DELAY]);

        let many = Backoff {
            initial: Duration::from_secs(1),
            factor: 2.0,
            steps: u32::MAX,
        };
        assert_eq!(many.delays().nth(2000), Some(MAX_BACKOFF_DELAY));
    }

    #[test]
    fn test_backoff_delays() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            factor: 2.0,
            steps: 4,
        };
        let delays: Vec<_> = backoff.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }
}
