use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::analytics::AggregateSnapshot;
use crate::cache::ResultCache;
use crate::error::EngineError;
use crate::pipeline::PipelineRun;
use crate::source::{self, SourceAdapter, SourceError};
use crate::types::{Config, Stats};

/// Maximum number of refresh records to keep
const MAX_HISTORY_SIZE: usize = 100;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "CHURNWATCH_CONFIG";

/// Where "now" comes from for a pipeline run.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Wall clock in the gym's timezone.
    System(Tz),
    /// Pinned instant, for tests and replays.
    Fixed(NaiveDateTime),
}

impl Clock {
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Clock::System(tz) => Utc::now().with_timezone(tz).naive_local(),
            Clock::Fixed(at) => *at,
        }
    }
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub member_count: Option<usize>,
    pub error: Option<String>,
}

/// Engine state shared by the binary, the refresh loop and tests.
pub struct EngineState {
    pub config: Config,
    pub clock: Clock,
    pub source: Arc<dyn SourceAdapter>,
    identity: String,
    pub runs: ResultCache<PipelineRun>,
    pub stats: ResultCache<Stats>,
    pub analytics: ResultCache<AggregateSnapshot>,
    refresh_history: Mutex<Vec<RefreshRecord>>,
}

impl EngineState {
    /// Validate the config and build the configured source adapter.
    pub fn from_config(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let source = source::from_config(&config).map_err(|e| match e {
            SourceError::Configuration(msg) => EngineError::Configuration(msg),
            other => EngineError::Upstream(other),
        })?;
        Self::new(config, Arc::from(source))
    }

    /// Build state around an already-constructed source.
    pub fn new(config: Config, source: Arc<dyn SourceAdapter>) -> Result<Self, EngineError> {
        let clock = Clock::System(config.tz()?);
        let ttl = config.cache_ttl();
        let identity = source.identity();
        log::info!(
            "Engine ready: source {}, cache TTL {}s, timezone {}",
            identity,
            config.cache_ttl_secs,
            config.timezone
        );
        Ok(Self {
            config,
            clock,
            source,
            identity,
            runs: ResultCache::new(ttl),
            stats: ResultCache::new(ttl),
            analytics: ResultCache::new(ttl),
            refresh_history: Mutex::new(Vec::new()),
        })
    }

    /// Pin "now", mostly for tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Cache key for one result kind, scoped to the source identity.
    pub fn cache_key(&self, kind: &str) -> String {
        format!("{}:{}", self.identity, kind)
    }

    /// Add a refresh record, newest first.
    pub fn add_refresh_record(&self, record: RefreshRecord) {
        let mut guard = self.refresh_history.lock();
        guard.insert(0, record);
        guard.truncate(MAX_HISTORY_SIZE);
    }

    pub fn get_refresh_history(&self, limit: usize) -> Vec<RefreshRecord> {
        self.refresh_history
            .lock()
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Resolve the config file path: `CHURNWATCH_CONFIG`, else
/// `~/.churnwatch/config.json`.
pub fn config_path() -> Result<PathBuf, EngineError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| EngineError::Configuration("Could not find home directory".to_string()))?;
    Ok(home.join(".churnwatch").join("config.json"))
}

/// Load configuration from the default location.
pub fn load_config() -> Result<Config, EngineError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config, EngineError> {
    if !path.exists() {
        return Err(EngineError::Configuration(format!(
            "Config file not found at {}. Create it with: {{ \"source\": {{ \"kind\": \"api\", \"baseUrl\": \"https://...\" }} }}",
            path.display()
        )));
    }

    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::Configuration(format!("Failed to read config: {}", e)))?;

    let config: Config = serde_json::from_str(&content)
        .map_err(|e| EngineError::Configuration(format!("Failed to parse config: {}", e)))?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FetchWindow, RawBatch};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::io::Write;

    struct Empty;

    #[async_trait]
    impl SourceAdapter for Empty {
        fn identity(&self) -> String {
            "empty".to_string()
        }

        async fn fetch(&self, _window: FetchWindow) -> Result<RawBatch, SourceError> {
            Ok(RawBatch::default())
        }
    }

    fn sheet_config_json(members: &str) -> String {
        format!(
            r#"{{ "source": {{ "kind": "sheet", "members": "{}", "visits": "{}" }}, "cacheTtlSecs": 120 }}"#,
            members, members
        )
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut f = fs::File::create(&path).unwrap();
        write!(f, "{}", sheet_config_json("leden.csv")).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.cache_ttl_secs, 120);
    }

    #[test]
    fn test_load_config_missing_or_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_config_from(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(EngineError::Configuration(_))));

        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_from(&path), Err(EngineError::Configuration(_))));

        fs::write(&path, r#"{ "source": { "kind": "api", "baseUrl": "" } }"#).unwrap();
        assert!(matches!(load_config_from(&path), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_from_config_fails_fast_on_missing_table() {
        let config: Config = serde_json::from_str(&sheet_config_json("/no/such/leden.csv")).unwrap();
        let result = EngineState::from_config(config);
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_cache_keys_are_scoped_to_source() {
        let config: Config = serde_json::from_str(&sheet_config_json("leden.csv")).unwrap();
        let state = EngineState::new(config, Arc::new(Empty)).unwrap();
        assert_eq!(state.cache_key("members"), "empty:members");
        assert_eq!(state.runs.ttl(), std::time::Duration::from_secs(120));
    }

    #[test]
    fn test_fixed_clock() {
        let config: Config = serde_json::from_str(&sheet_config_json("leden.csv")).unwrap();
        let at = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let state = EngineState::new(config, Arc::new(Empty))
            .unwrap()
            .with_clock(Clock::Fixed(at));
        assert_eq!(state.now(), at);
    }

    #[test]
    fn test_refresh_history_is_capped_newest_first() {
        let config: Config = serde_json::from_str(&sheet_config_json("leden.csv")).unwrap();
        let state = EngineState::new(config, Arc::new(Empty)).unwrap();
        for i in 0..(MAX_HISTORY_SIZE + 5) {
            state.add_refresh_record(RefreshRecord {
                id: i.to_string(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                member_count: Some(i),
                error: None,
            });
        }
        let history = state.get_refresh_history(usize::MAX);
        assert_eq!(history.len(), MAX_HISTORY_SIZE);
        assert_eq!(history[0].id, (MAX_HISTORY_SIZE + 4).to_string());
        assert_eq!(state.get_refresh_history(3).len(), 3);
    }
}
