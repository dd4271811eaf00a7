//! Configuration surface (spec §6, expanded in SPEC_FULL.md §D). Loaded
//! from the closed set of environment variables the spec names; validated
//! eagerly so a misconfigured proxy fails at startup rather than on first
//! connection, matching the teacher's "build the whole `Configuration`
//! before serving a single request" discipline.

use std::env;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::num::ParseIntError;

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("environment variable {name} has an invalid value {value:?}: {source}")]
    InvalidAddr {
        name: &'static str,
        value: String,
        #[source]
        source: AddrParseError,
    },
    #[error("environment variable {name} has an invalid value {value:?}: {source}")]
    InvalidPort {
        name: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// One upstream cluster's connection and auth settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub contact_point: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// The fully validated configuration for one proxy process.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub query_listen: SocketAddr,
    pub metrics_listen: Option<SocketAddr>,
    pub origin: ClusterConfig,
    pub target: ClusterConfig,
    /// Bound capacity of the process-wide prepared-statement cache (§3,
    /// SPEC_FULL.md §D). Not named in spec.md's closed env-var list, so it
    /// is read separately with a generous default rather than being a
    /// required variable.
    pub prepared_cache_capacity: u64,
}

fn read_var(name: &'static str) -> Result<String, ConfigurationError> {
    env::var(name).map_err(|_| ConfigurationError::MissingVar(name))
}

fn read_var_opt(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_port(name: &'static str, value: &str) -> Result<u16, ConfigurationError> {
    value
        .parse::<u16>()
        .map_err(|source| ConfigurationError::InvalidPort {
            name,
            value: value.to_owned(),
            source,
        })
}

fn parse_ip(name: &'static str, value: &str) -> Result<IpAddr, ConfigurationError> {
    value
        .parse::<IpAddr>()
        .map_err(|source| ConfigurationError::InvalidAddr {
            name,
            value: value.to_owned(),
            source,
        })
}

fn resolve_contact_point(
    contact_var: &'static str,
    port_var: &'static str,
) -> Result<SocketAddr, ConfigurationError> {
    let contact_points = read_var(contact_var)?;
    // Only the first contact point is dialed per connection; a complete
    // multi-node driver with load balancing is out of scope (spec §1: the
    // core does not implement retries or topology-aware routing).
    let first = contact_points
        .split(',')
        .next()
        .unwrap_or(&contact_points)
        .trim();
    let ip = parse_ip(contact_var, first)?;
    let port = parse_port(port_var, &read_var(port_var)?)?;
    Ok(SocketAddr::new(ip, port))
}

impl Configuration {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let query_ip = parse_ip(
            "PROXY_QUERY_ADDRESS",
            &read_var("PROXY_QUERY_ADDRESS")?,
        )?;
        let query_port = parse_port("PROXY_QUERY_PORT", &read_var("PROXY_QUERY_PORT")?)?;

        let metrics_listen = match read_var_opt("PROXY_METRICS_ADDRESS") {
            Some(addr) => Some(
                addr.parse::<SocketAddr>()
                    .map_err(|source| ConfigurationError::InvalidAddr {
                        name: "PROXY_METRICS_ADDRESS",
                        value: addr,
                        source,
                    })?,
            ),
            None => None,
        };

        let origin = ClusterConfig {
            contact_point: resolve_contact_point(
                "ORIGIN_CASSANDRA_CONTACT_POINTS",
                "ORIGIN_CASSANDRA_PORT",
            )?,
            username: read_var_opt("ORIGIN_CASSANDRA_USERNAME"),
            password: read_var_opt("ORIGIN_CASSANDRA_PASSWORD"),
        };
        let target = ClusterConfig {
            contact_point: resolve_contact_point(
                "TARGET_CASSANDRA_CONTACT_POINTS",
                "TARGET_CASSANDRA_PORT",
            )?,
            username: read_var_opt("TARGET_CASSANDRA_USERNAME"),
            password: read_var_opt("TARGET_CASSANDRA_PASSWORD"),
        };

        let prepared_cache_capacity = read_var_opt("PREPARED_CACHE_MAX_ENTRIES")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(100_000);

        Ok(Configuration {
            query_listen: SocketAddr::new(query_ip, query_port),
            metrics_listen,
            origin,
            target,
            prepared_cache_capacity,
        })
    }
}

/// Small CLI surface layered over the environment-variable configuration,
/// matching the teacher's pattern of a minimal `Opt` struct parsed once in
/// `main` (SPEC_FULL.md §D).
#[derive(Debug, Parser)]
#[command(name = "cqlproxy", about = "Dual-write CQL proxy for cluster migration")]
pub struct Opt {
    /// Load and validate configuration, then exit without starting the
    /// listener.
    #[arg(long)]
    pub config_check: bool,

    /// Overrides the `RUST_LOG` filter directive.
    #[arg(short = 'v', long = "log-level")]
    pub log_level: Option<String>,
}
