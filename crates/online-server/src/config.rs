//! Server configuration: CLI flags + environment, flags take precedence.
//!
//! Environment variables: `ONLINE_LISTEN`, `ONLINE_PORT_MIN`,
//! `ONLINE_PORT_MAX`, `ONLINE_REQUEST_TIMEOUT`. Resolution is pure so it can
//! be tested against a scratch environment lookup.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8765";
pub const DEFAULT_PORT_MIN: u16 = 10000;
pub const DEFAULT_PORT_MAX: u16 = 10099;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CLIENTS: usize = 64;
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub port_min: u16,
    pub port_max: u16,
    pub request_timeout: Duration,
    pub max_clients: usize,
}

impl ServerConfig {
    /// Merge CLI values with the environment. A `None` CLI value falls back
    /// to the corresponding `ONLINE_*` variable, then to the default.
    pub fn resolve(
        cli_listen: Option<&str>,
        cli_port_range: Option<&str>,
        cli_request_timeout: Option<u64>,
        cli_max_clients: Option<usize>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let listen_str = cli_listen
            .map(str::to_string)
            .or_else(|| env("ONLINE_LISTEN"))
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|e| invalid("listen address", format!("{listen_str:?}: {e}")))?;

        let (port_min, port_max) = match cli_port_range {
            Some(range) => parse_port_range(range)?,
            None => {
                let port_min = match env("ONLINE_PORT_MIN") {
                    Some(raw) => raw
                        .parse::<u16>()
                        .map_err(|e| invalid("ONLINE_PORT_MIN", format!("{raw:?}: {e}")))?,
                    None => DEFAULT_PORT_MIN,
                };
                let port_max = match env("ONLINE_PORT_MAX") {
                    Some(raw) => raw
                        .parse::<u16>()
                        .map_err(|e| invalid("ONLINE_PORT_MAX", format!("{raw:?}: {e}")))?,
                    None => DEFAULT_PORT_MAX,
                };
                (port_min, port_max)
            }
        };
        if port_min == 0 {
            return Err(invalid("port range", "port 0 is not allocatable"));
        }
        if port_min > port_max {
            return Err(invalid(
                "port range",
                format!("{port_min} is greater than {port_max}"),
            ));
        }

        let timeout_secs = match cli_request_timeout {
            Some(secs) => secs,
            None => match env("ONLINE_REQUEST_TIMEOUT") {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|e| invalid("ONLINE_REQUEST_TIMEOUT", format!("{raw:?}: {e}")))?,
                None => DEFAULT_REQUEST_TIMEOUT_SECS,
            },
        };
        if timeout_secs == 0 {
            return Err(invalid("request timeout", "must be at least 1 second"));
        }

        let max_clients = cli_max_clients.unwrap_or(DEFAULT_MAX_CLIENTS);
        if max_clients == 0 {
            return Err(invalid("max clients", "must be at least 1"));
        }

        Ok(Self {
            listen,
            port_min,
            port_max,
            request_timeout: Duration::from_secs(timeout_secs),
            max_clients,
        })
    }
}

/// Parse an inclusive `MIN-MAX` public port range.
fn parse_port_range(raw: &str) -> Result<(u16, u16), ConfigError> {
    let (min_str, max_str) = raw
        .split_once('-')
        .ok_or_else(|| invalid("port range", format!("{raw:?}: expected MIN-MAX")))?;
    let min = min_str
        .trim()
        .parse::<u16>()
        .map_err(|e| invalid("port range", format!("{min_str:?}: {e}")))?;
    let max = max_str
        .trim()
        .parse::<u16>()
        .map_err(|e| invalid("port range", format!("{max_str:?}: {e}")))?;
    Ok((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_apply_without_flags_or_env() {
        let config = ServerConfig::resolve(None, None, None, None, &no_env).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN.parse().unwrap());
        assert_eq!((config.port_min, config.port_max), (DEFAULT_PORT_MIN, DEFAULT_PORT_MAX));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
    }

    #[test]
    fn port_range_flag_parses_inclusive_bounds() {
        let config =
            ServerConfig::resolve(None, Some("5000-5000"), None, None, &no_env).unwrap();
        assert_eq!((config.port_min, config.port_max), (5000, 5000));
    }

    #[test]
    fn bad_port_ranges_are_config_errors() {
        for raw in ["5000", "a-b", "5001-5000", "0-10", ""] {
            assert!(
                ServerConfig::resolve(None, Some(raw), None, None, &no_env).is_err(),
                "range {raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn env_fills_in_missing_flags() {
        let env = |name: &str| match name {
            "ONLINE_LISTEN" => Some("127.0.0.1:9000".to_string()),
            "ONLINE_PORT_MIN" => Some("6000".to_string()),
            "ONLINE_PORT_MAX" => Some("6010".to_string()),
            "ONLINE_REQUEST_TIMEOUT" => Some("5".to_string()),
            _ => None,
        };
        let config = ServerConfig::resolve(None, None, None, None, &env).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!((config.port_min, config.port_max), (6000, 6010));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn flags_take_precedence_over_env() {
        let env = |name: &str| match name {
            "ONLINE_LISTEN" => Some("127.0.0.1:9000".to_string()),
            "ONLINE_PORT_MIN" => Some("6000".to_string()),
            "ONLINE_PORT_MAX" => Some("6010".to_string()),
            "ONLINE_REQUEST_TIMEOUT" => Some("5".to_string()),
            _ => None,
        };
        let config = ServerConfig::resolve(
            Some("0.0.0.0:8888"),
            Some("7000-7001"),
            Some(60),
            Some(2),
            &env,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:8888".parse().unwrap());
        assert_eq!((config.port_min, config.port_max), (7000, 7001));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.max_clients, 2);
    }

    #[test]
    fn zero_timeout_and_zero_clients_are_rejected() {
        assert!(ServerConfig::resolve(None, None, Some(0), None, &no_env).is_err());
        assert!(ServerConfig::resolve(None, None, None, Some(0), &no_env).is_err());
    }

    #[test]
    fn unparsable_env_is_a_config_error() {
        let env = |name: &str| match name {
            "ONLINE_PORT_MIN" => Some("lots".to_string()),
            _ => None,
        };
        assert!(ServerConfig::resolve(None, None, None, None, &env).is_err());
    }
}
