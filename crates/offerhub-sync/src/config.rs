use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub sources_path: PathBuf,
    pub fetch_timeout: Duration,
    pub max_parallel_fetches: usize,
    pub user_agent: String,
    pub auto_publish: bool,
    /// Also commit the store directory to git when auto-publishing.
    pub git_publish: bool,
    pub git_push: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub log_format: LogFormat,
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparseable values
    /// fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            store_dir: lookup("OFFERHUB_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            sources_path: lookup("OFFERHUB_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            fetch_timeout: Duration::from_secs(
                lookup("OFFERHUB_FETCH_TIMEOUT_SECS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(30),
            ),
            max_parallel_fetches: lookup("OFFERHUB_MAX_PARALLEL_FETCHES")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
            user_agent: lookup("OFFERHUB_USER_AGENT")
                .unwrap_or_else(|| format!("offerhub-bot/{}", env!("CARGO_PKG_VERSION"))),
            auto_publish: lookup("OFFERHUB_AUTO_PUBLISH").map(|v| truthy(&v)).unwrap_or(false),
            git_publish: lookup("OFFERHUB_GIT_PUBLISH").map(|v| truthy(&v)).unwrap_or(false),
            git_push: lookup("OFFERHUB_GIT_PUSH").map(|v| truthy(&v)).unwrap_or(true),
            scheduler_enabled: lookup("OFFERHUB_SCHEDULER_ENABLED")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            sync_cron: lookup("OFFERHUB_SYNC_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            log_format: match lookup("OFFERHUB_LOG_FORMAT").as_deref() {
                Some("json") | Some("JSON") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }

    /// Directory that relative paths in the source registry resolve against.
    pub fn sources_base_dir(&self) -> PathBuf {
        match self.sources_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.store_dir, PathBuf::from("./data"));
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.max_parallel_fetches, 4);
        assert_eq!(config.sync_cron, "0 0 */6 * * *");
        assert!(!config.auto_publish);
        assert!(!config.git_publish);
        assert!(config.git_push);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.sources_base_dir(), PathBuf::from("."));
    }

    #[test]
    fn overrides_are_parsed() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OFFERHUB_STORE_DIR", "/var/lib/offerhub"),
            ("OFFERHUB_SOURCES", "/etc/offerhub/sources.yaml"),
            ("OFFERHUB_FETCH_TIMEOUT_SECS", "5"),
            ("OFFERHUB_MAX_PARALLEL_FETCHES", "0"),
            ("OFFERHUB_AUTO_PUBLISH", "true"),
            ("OFFERHUB_LOG_FORMAT", "json"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/offerhub"));
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.max_parallel_fetches, 4);
        assert!(config.auto_publish);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.sources_base_dir(), PathBuf::from("/etc/offerhub"));
    }
}
