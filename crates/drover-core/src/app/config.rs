//! Coordinator configuration.
//!
//! TOML file values with serde defaults; the CLI overrides individual
//! fields afterwards. The working directory is captured once at startup
//! and travels as a field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::DEFAULT_FLUSH_THRESHOLD;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Number of worker slots.
    pub workers: usize,
    /// Thread hint per worker. Defaults to the largest group hint.
    pub worker_threads: Option<u32>,
    pub worker_mem_mb: u64,
    pub worker_time_min: u64,
    pub partition: String,
    /// Per-slot temp bases are `<tmp_prefix>_<slot>`. Defaults next to the graph.
    pub tmp_prefix: Option<PathBuf>,
    pub bind_host: String,
    /// Host workers connect back to. Defaults to this machine's hostname.
    pub advertise_host: Option<String>,
    pub port: u16,
    pub tick_ms: u64,
    pub flush_threshold: usize,

    #[serde(skip)]
    pub working_dir: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            worker_threads: None,
            worker_mem_mb: 40_000,
            worker_time_min: 1_440,
            partition: "haswell".to_string(),
            tmp_prefix: None,
            bind_host: "0.0.0.0".to_string(),
            advertise_host: None,
            port: 0,
            tick_ms: 1_000,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            working_dir: PathBuf::from("."),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(10))
    }

    /// Explicit host, else the local hostname, else loopback.
    pub fn resolve_advertise_host(&self) -> String {
        if let Some(host) = &self.advertise_host {
            return host.clone();
        }
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn resolve_tmp_prefix(&self, graph: &Path) -> PathBuf {
        match &self.tmp_prefix {
            Some(prefix) => prefix.clone(),
            None => {
                let mut name = graph.as_os_str().to_owned();
                name.push(".tmp");
                PathBuf::from(name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = CoordinatorConfig::from_toml_str("").unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.workers, 16);
        assert_eq!(config.partition, "haswell");
        assert_eq!(config.tick(), Duration::from_secs(1));
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config = CoordinatorConfig::from_toml_str(
            r#"
            workers = 4
            partition = "bigmem"
            advertise_host = "head01"
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.partition, "bigmem");
        assert_eq!(config.worker_mem_mb, 40_000);
        assert_eq!(config.resolve_advertise_host(), "head01");
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(matches!(
            CoordinatorConfig::from_toml_str("workers = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn tmp_prefix_defaults_next_to_graph() {
        let config = CoordinatorConfig::default();
        assert_eq!(
            config.resolve_tmp_prefix(Path::new("/data/pipe.graph")),
            PathBuf::from("/data/pipe.graph.tmp")
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoordinatorConfig::load(&dir.path().join("none.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
