use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub attack_catalog_path: PathBuf,
    pub import_deadline: Option<Duration>,
    pub correlation_concurrency: usize,
    pub default_project: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attack_catalog_path: PathBuf::from("data/attacks.json"),
            import_deadline: None,
            correlation_concurrency: 4,
            default_project: "default".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from the environment. Unset or unparseable values
    /// fall back to their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            attack_catalog_path: lookup("ATTACK_CATALOG_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.attack_catalog_path),
            import_deadline: lookup("IMPORT_DEADLINE_SECS")
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
            correlation_concurrency: lookup("CORRELATION_CONCURRENCY")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(defaults.correlation_concurrency)
                .max(1),
            default_project: lookup("DEFAULT_PROJECT")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.default_project),
        }
    }
}
