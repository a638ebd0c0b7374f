//! Process configuration, read from `CLASSBOOK_*` environment variables.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use thiserror::Error;

use crate::limits::{MAX_STEP_MINUTES, MIN_STEP_MINUTES};
use crate::model::{MINUTE_MS, Ms};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}: cannot parse {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{name}: {reason}")]
    OutOfRange { name: &'static str, reason: String },
    #[error("both CLASSBOOK_TLS_CERT and CLASSBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Knobs of the scheduling core that the business may tune without a code change.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    /// Granularity of offered start times.
    pub step_minutes: u32,
    /// A cancellation refunds the lesson only if made at least this long before the class starts.
    pub refund_cutoff_minutes: i64,
    pub persistence_timeout: Duration,
    pub provisioning_timeout: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            step_minutes: 30,
            refund_cutoff_minutes: 0,
            persistence_timeout: Duration::from_secs(5),
            provisioning_timeout: Duration::from_secs(3),
        }
    }
}

impl SchedulingConfig {
    pub fn refund_cutoff_ms(&self) -> Ms {
        self.refund_cutoff_minutes * MINUTE_MS
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub meeting_url_base: Option<String>,
    pub link_backfill_interval: Duration,
    pub scheduling: SchedulingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        let step_minutes: u32 = parse_or(&get, "CLASSBOOK_SLOT_STEP_MINUTES", 30)?;
        if !(MIN_STEP_MINUTES..=MAX_STEP_MINUTES).contains(&step_minutes) {
            return Err(ConfigError::OutOfRange {
                name: "CLASSBOOK_SLOT_STEP_MINUTES",
                reason: format!("must be within {MIN_STEP_MINUTES}..={MAX_STEP_MINUTES}"),
            });
        }
        let refund_cutoff_minutes: i64 = parse_or(&get, "CLASSBOOK_REFUND_CUTOFF_MINUTES", 0)?;
        if refund_cutoff_minutes < 0 {
            return Err(ConfigError::OutOfRange {
                name: "CLASSBOOK_REFUND_CUTOFF_MINUTES",
                reason: "must not be negative".into(),
            });
        }

        let tls_cert = get("CLASSBOOK_TLS_CERT");
        let tls_key = get("CLASSBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            bind: get("CLASSBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "CLASSBOOK_PORT", 5433)?,
            data_dir: PathBuf::from(get("CLASSBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("CLASSBOOK_PASSWORD").unwrap_or_else(|| "classbook".into()),
            max_connections: parse_or(&get, "CLASSBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "CLASSBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&get, "CLASSBOOK_METRICS_PORT")?,
            tls_cert,
            tls_key,
            meeting_url_base: get("CLASSBOOK_MEETING_URL_BASE"),
            link_backfill_interval: Duration::from_secs(parse_or(
                &get,
                "CLASSBOOK_LINK_BACKFILL_SECS",
                60,
            )?),
            scheduling: SchedulingConfig {
                step_minutes,
                refund_cutoff_minutes,
                persistence_timeout: Duration::from_millis(parse_or(
                    &get,
                    "CLASSBOOK_PERSISTENCE_TIMEOUT_MS",
                    5000,
                )?),
                provisioning_timeout: Duration::from_millis(parse_or(
                    &get,
                    "CLASSBOOK_PROVISIONING_TIMEOUT_MS",
                    3000,
                )?),
            },
        })
    }

    /// Load the TLS acceptor if a certificate pair is configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(get, name)?.unwrap_or(default))
}

fn parse_opt<T: std::str::FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
