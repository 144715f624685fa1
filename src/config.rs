use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_PORT: u16 = 5433;
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_MAX_CONNECTIONS: usize = 256;
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

/// Server settings, read from `RENTLEDGER_*` environment variables.
/// Unparsable numbers fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: parsed(&lookup, "RENTLEDGER_PORT").unwrap_or(DEFAULT_PORT),
            bind: lookup("RENTLEDGER_BIND").unwrap_or_else(|| DEFAULT_BIND.into()),
            data_dir: lookup("RENTLEDGER_DATA_DIR")
                .unwrap_or_else(|| DEFAULT_DATA_DIR.into())
                .into(),
            max_connections: parsed::<usize>(&lookup, "RENTLEDGER_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            compact_threshold: parsed(&lookup, "RENTLEDGER_COMPACT_THRESHOLD")
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            metrics_port: parsed(&lookup, "RENTLEDGER_METRICS_PORT"),
            tls_cert: lookup("RENTLEDGER_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("RENTLEDGER_TLS_KEY").map(PathBuf::from),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
