use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

/// The fully-resolved, validated configuration the core runs with, after layering
/// (lowest to highest precedence) hardcoded defaults, an optional YAML file, and
/// `OXCORE_*` environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub gc_interval: Duration,
    pub worker_stall_after: Duration,
    pub container_final_ttl: Duration,
    pub db_dsn: String,
    pub db_max_conns: u32,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(30),
            worker_stall_after: Duration::from_secs(5 * 60),
            container_final_ttl: Duration::from_secs(5 * 60),
            db_dsn: "postgres://localhost/oxcore".to_string(),
            db_max_conns: 10,
            log_level: "info".to_string(),
        }
    }
}

/// Mirrors [`RuntimeConfig`] field-for-field but with every field optional, so a
/// partial YAML file only overrides what it sets. Durations are seconds in the file
/// to avoid pulling in a duration-parsing crate the rest of the stack doesn't use.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    gc: GcSection,
    #[serde(default)]
    worker: WorkerSection,
    #[serde(default)]
    container: ContainerSection,
    #[serde(default)]
    db: DbSection,
    #[serde(default)]
    log: LogSection,
}

#[derive(Debug, Default, Deserialize)]
struct GcSection {
    interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerSection {
    stall_after_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerSection {
    final_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DbSection {
    dsn: Option<String>,
    max_conns: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LogSection {
    level: Option<String>,
}

impl RuntimeConfig {
    /// Load configuration from an optional YAML file path, then overlay environment
    /// variables, then fall back to defaults for anything unset.
    pub fn load(yaml_path: Option<&std::path::Path>) -> CoreResult<Self> {
        let mut cfg = RuntimeConfig::default();

        if let Some(path) = yaml_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| CoreError::Other(anyhow::anyhow!("reading config file {}: {}", path.display(), e)))?;
                let file_cfg: FileConfig = serde_yaml::from_str(&contents)
                    .map_err(|e| CoreError::Other(anyhow::anyhow!("parsing config file {}: {}", path.display(), e)))?;
                cfg.apply_file(file_cfg);
            }
        }

        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(secs) = file.gc.interval_secs {
            self.gc_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.worker.stall_after_secs {
            self.worker_stall_after = Duration::from_secs(secs);
        }
        if let Some(secs) = file.container.final_ttl_secs {
            self.container_final_ttl = Duration::from_secs(secs);
        }
        if let Some(dsn) = file.db.dsn {
            self.db_dsn = dsn;
        }
        if let Some(max_conns) = file.db.max_conns {
            self.db_max_conns = max_conns;
        }
        if let Some(level) = file.log.level {
            self.log_level = level;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OXCORE_GC_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.gc_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("OXCORE_WORKER_STALL_AFTER_SECS") {
            if let Ok(secs) = v.parse() {
                self.worker_stall_after = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("OXCORE_CONTAINER_FINAL_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                self.container_final_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("OXCORE_DB_DSN") {
            self.db_dsn = v;
        }
        if let Ok(v) = std::env::var("OXCORE_DB_MAX_CONNS") {
            if let Ok(n) = v.parse() {
                self.db_max_conns = n;
            }
        }
        if let Ok(v) = std::env::var("OXCORE_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if self.db_dsn.trim().is_empty() {
            return Err(CoreError::Other(anyhow::anyhow!("db.dsn must not be empty")));
        }
        if self.db_max_conns == 0 {
            return Err(CoreError::Other(anyhow::anyhow!("db.max_conns must be at least 1")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.gc_interval, Duration::from_secs(30));
        assert_eq!(cfg.worker_stall_after, Duration::from_secs(300));
        assert_eq!(cfg.container_final_ttl, Duration::from_secs(300));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oxcore.yaml");
        std::fs::write(&path, "gc:\n  interval_secs: 5\ndb:\n  dsn: postgres://x/y\n").unwrap();
        let cfg = RuntimeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.gc_interval, Duration::from_secs(5));
        assert_eq!(cfg.db_dsn, "postgres://x/y");
        // untouched fields keep their default
        assert_eq!(cfg.worker_stall_after, Duration::from_secs(300));
    }
}
