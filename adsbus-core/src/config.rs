//! Bus configuration and endpoint specifications.
//!
//! Endpoints arrive as command-line flag/value pairs such as
//! `connect-send=json=feeder.local/30005`. Parsing happens once at startup;
//! anything malformed is a configuration error and the process refuses to
//! start.

use std::path::PathBuf;

use crate::codec::Format;
use crate::retry::RetryPolicy;
use crate::types::{AdsbusError, Result};

/// Environment variable overriding the relay hop ceiling.
pub const MAX_HOPS_ENV: &str = "ADSBUS_MAX_HOPS";

/// Runtime-wide settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Packets that have already crossed this many dispatchers are dropped.
    pub max_hops: u16,
    pub retry: RetryPolicy,
    pub resolver_threads: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            max_hops: 5,
            retry: RetryPolicy::default(),
            resolver_threads: 4,
        }
    }
}

impl BusConfig {
    /// Defaults, with `ADSBUS_MAX_HOPS` applied if set.
    pub fn from_env() -> Result<Self> {
        let mut config = BusConfig::default();
        if let Ok(val) = std::env::var(MAX_HOPS_ENV) {
            config.max_hops = parse_max_hops(&val)?;
        }
        Ok(config)
    }
}

fn parse_max_hops(val: &str) -> Result<u16> {
    match val.trim().parse::<u16>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(AdsbusError::Config(format!(
            "{MAX_HOPS_ENV} must be a positive integer, got {val:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// What a transport does with its byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Receive,
    Send(Format),
    /// Bridge: send and receive over the same stream.
    SendReceive(Format),
}

impl Role {
    pub fn receives(self) -> bool {
        matches!(self, Role::Receive | Role::SendReceive(_))
    }

    pub fn send_format(self) -> Option<Format> {
        match self {
            Role::Receive => None,
            Role::Send(f) | Role::SendReceive(f) => Some(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    /// Create + truncate.
    Write,
    Append,
}

/// Where the byte stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Connect { host: String, port: String },
    Listen { host: Option<String>, port: String },
    File { path: PathBuf, mode: FileMode },
    Exec { command: String },
    Stdin,
    Stdout,
}

/// One configured endpoint: a transport target plus the role it plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub role: Role,
    pub target: Target,
}

/// Every endpoint flag, with its value syntax.
pub const ENDPOINT_FLAGS: &[(&str, &str)] = &[
    ("connect-receive", "HOST/PORT"),
    ("connect-send", "FORMAT=HOST/PORT"),
    ("connect-send-receive", "FORMAT=HOST/PORT"),
    ("listen-receive", "[HOST/]PORT"),
    ("listen-send", "FORMAT=[HOST/]PORT"),
    ("listen-send-receive", "FORMAT=[HOST/]PORT"),
    ("file-read", "PATH"),
    ("file-write", "FORMAT=PATH"),
    ("file-write-read", "FORMAT=PATH"),
    ("file-append", "FORMAT=PATH"),
    ("file-append-read", "FORMAT=PATH"),
    ("exec-receive", "COMMAND"),
    ("exec-send", "FORMAT=COMMAND"),
    ("exec-send-receive", "FORMAT=COMMAND"),
    ("stdin", ""),
    ("stdout", "FORMAT"),
];

impl EndpointSpec {
    /// Parse the value of endpoint flag `flag` (without leading dashes).
    pub fn parse(flag: &str, value: &str) -> Result<Self> {
        if !ENDPOINT_FLAGS.iter().any(|(name, _)| *name == flag) {
            return Err(AdsbusError::Config(format!("unknown endpoint flag --{flag}")));
        }
        let bad = |why: &str| AdsbusError::Config(format!("--{flag}={value}: {why}"));

        let (transport, role_name) = flag.split_once('-').unwrap_or((flag, ""));
        let (role, rest) = match role_name {
            "receive" | "read" => (Role::Receive, value),
            "send" | "write" | "append" => {
                let (format, rest) = split_format(value).map_err(|e| bad(&e))?;
                (Role::Send(format), rest)
            }
            "send-receive" | "write-read" | "append-read" => {
                let (format, rest) = split_format(value).map_err(|e| bad(&e))?;
                (Role::SendReceive(format), rest)
            }
            "" if flag == "stdin" => (Role::Receive, value),
            "" if flag == "stdout" => {
                let format = parse_send_format(value).map_err(|e| bad(&e))?;
                (Role::Send(format), "")
            }
            _ => return Err(AdsbusError::Config(format!("unknown endpoint flag --{flag}"))),
        };

        let target = match transport {
            "connect" => {
                let (host, port) = rest
                    .split_once('/')
                    .ok_or_else(|| bad("expected HOST/PORT"))?;
                if host.is_empty() || port.is_empty() {
                    return Err(bad("expected HOST/PORT"));
                }
                Target::Connect {
                    host: host.to_string(),
                    port: port.to_string(),
                }
            }
            "listen" => {
                let (host, port) = match rest.split_once('/') {
                    Some((host, port)) => (Some(host.to_string()), port),
                    None => (None, rest),
                };
                if port.is_empty() {
                    return Err(bad("expected [HOST/]PORT"));
                }
                Target::Listen {
                    host,
                    port: port.to_string(),
                }
            }
            "file" => {
                if rest.is_empty() {
                    return Err(bad("expected PATH"));
                }
                let mode = match role_name {
                    "read" => FileMode::Read,
                    "write" | "write-read" => FileMode::Write,
                    _ => FileMode::Append,
                };
                Target::File {
                    path: PathBuf::from(rest),
                    mode,
                }
            }
            "exec" => {
                if rest.trim().is_empty() {
                    return Err(bad("expected COMMAND"));
                }
                Target::Exec {
                    command: rest.to_string(),
                }
            }
            "stdin" => Target::Stdin,
            "stdout" => Target::Stdout,
            _ => return Err(AdsbusError::Config(format!("unknown endpoint flag --{flag}"))),
        };

        Ok(EndpointSpec { role, target })
    }
}

fn split_format(value: &str) -> std::result::Result<(Format, &str), String> {
    let (name, rest) = value
        .split_once('=')
        .ok_or_else(|| "expected FORMAT=...".to_string())?;
    Ok((parse_send_format(name)?, rest))
}

fn parse_send_format(name: &str) -> std::result::Result<Format, String> {
    Format::from_name(name).ok_or_else(|| {
        format!(
            "unknown format {name:?} (expected one of: {})",
            Format::ALL
                .iter()
                .map(|f| f.name())
                .collect::<Vec<_>>()
                .join(", ")
        )
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.max_hops, 5);
        assert_eq!(config.resolver_threads, 4);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_parse_max_hops() {
        assert_eq!(parse_max_hops("3").unwrap(), 3);
        assert_eq!(parse_max_hops(" 12 ").unwrap(), 12);
        assert!(parse_max_hops("0").is_err());
        assert!(parse_max_hops("-1").is_err());
        assert!(parse_max_hops("lots").is_err());
    }

    #[test]
    fn test_connect_receive() {
        let spec = EndpointSpec::parse("connect-receive", "feeder.local/30005").unwrap();
        assert_eq!(spec.role, Role::Receive);
        assert_eq!(
            spec.target,
            Target::Connect {
                host: "feeder.local".into(),
                port: "30005".into()
            }
        );
        assert!(EndpointSpec::parse("connect-receive", "30005").is_err());
    }

    #[test]
    fn test_connect_send_with_format() {
        let spec = EndpointSpec::parse("connect-send", "beast=10.0.0.1/30005").unwrap();
        assert_eq!(spec.role, Role::Send(Format::Beast));
        assert!(matches!(spec.target, Target::Connect { .. }));
    }

    #[test]
    fn test_listen_optional_host() {
        let spec = EndpointSpec::parse("listen-receive", "30001").unwrap();
        assert_eq!(
            spec.target,
            Target::Listen {
                host: None,
                port: "30001".into()
            }
        );
        let spec = EndpointSpec::parse("listen-send-receive", "json=::1/30002").unwrap();
        assert_eq!(spec.role, Role::SendReceive(Format::Json));
        assert_eq!(
            spec.target,
            Target::Listen {
                host: Some("::1".into()),
                port: "30002".into()
            }
        );
    }

    #[test]
    fn test_file_modes() {
        let spec = EndpointSpec::parse("file-read", "/tmp/in.txt").unwrap();
        assert_eq!(spec.role, Role::Receive);
        assert!(matches!(
            spec.target,
            Target::File {
                mode: FileMode::Read,
                ..
            }
        ));
        let spec = EndpointSpec::parse("file-write-read", "raw=/tmp/out.txt").unwrap();
        assert_eq!(spec.role, Role::SendReceive(Format::Raw));
        assert!(matches!(
            spec.target,
            Target::File {
                mode: FileMode::Write,
                ..
            }
        ));
        let spec = EndpointSpec::parse("file-append", "stats=/tmp/stats.log").unwrap();
        assert_eq!(spec.role, Role::Send(Format::Stats));
        assert!(matches!(
            spec.target,
            Target::File {
                mode: FileMode::Append,
                ..
            }
        ));
    }

    #[test]
    fn test_exec_keeps_equals_in_command() {
        let spec = EndpointSpec::parse("exec-send", "json=nc -l 1234 --opt=x").unwrap();
        assert_eq!(spec.role, Role::Send(Format::Json));
        assert_eq!(
            spec.target,
            Target::Exec {
                command: "nc -l 1234 --opt=x".into()
            }
        );
    }

    #[test]
    fn test_stdin_stdout() {
        let spec = EndpointSpec::parse("stdin", "").unwrap();
        assert_eq!((spec.role, spec.target), (Role::Receive, Target::Stdin));
        let spec = EndpointSpec::parse("stdout", "airspy_adsb").unwrap();
        assert_eq!(spec.role, Role::Send(Format::AirspyAdsb));
        assert_eq!(spec.target, Target::Stdout);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let err = EndpointSpec::parse("connect-send", "sbs=host/30003").unwrap_err();
        assert!(err.to_string().contains("unknown format"));
        assert!(EndpointSpec::parse("stdout", "").is_err());
        assert!(EndpointSpec::parse("connect-send", "host/30003").is_err());
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(EndpointSpec::parse("teleport-receive", "x").is_err());
        assert!(EndpointSpec::parse("connect-sideways", "h/1").is_err());
    }

    #[test]
    fn test_role_helpers() {
        assert!(Role::Receive.receives());
        assert!(Role::SendReceive(Format::Json).receives());
        assert!(!Role::Send(Format::Json).receives());
        assert_eq!(Role::Receive.send_format(), None);
        assert_eq!(Role::Send(Format::Raw).send_format(), Some(Format::Raw));
    }
}
