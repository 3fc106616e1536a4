use crate::candidacy::models::CandidacyConfig;
use crate::models::{ControlState, FreshnessSource, ResourceTier, SystemId};
use crate::sources::enrichment::RatePolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

/// Powers a commander can pledge to.
pub const KNOWN_POWERS: [&str; 12] = [
    "Aisling Duval",
    "Archon Delaine",
    "Arissa Lavigny-Duval",
    "Denton Patreus",
    "Edmund Mahon",
    "Felicia Winters",
    "Jerome Archer",
    "Li Yong-Rui",
    "Nakato Kaine",
    "Pranav Antal",
    "Yuri Grom",
    "Zemina Torval",
];

/// Case-insensitive lookup of a power's canonical spelling.
pub fn canonical_power(name: &str) -> Option<&'static str> {
    let needle = name.trim();
    KNOWN_POWERS
        .iter()
        .copied()
        .find(|p| p.eq_ignore_ascii_case(needle))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl RatePolicy {
    /// Read `HUGINN_{prefix}_*` overrides on top of `defaults`.
    pub fn from_env(prefix: &str, defaults: RatePolicy) -> Self {
        let key = |suffix: &str| format!("HUGINN_{prefix}_{suffix}");
        Self {
            max_concurrent: env_parse(&key("MAX_CONCURRENT")).unwrap_or(defaults.max_concurrent),
            min_interval: env_parse::<u64>(&key("MIN_INTERVAL_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_interval),
            request_timeout: env_parse::<u64>(&key("TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            max_attempts: env_parse(&key("MAX_ATTEMPTS")).unwrap_or(defaults.max_attempts),
            backoff_base: env_parse::<u64>(&key("BACKOFF_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            max_rate_limit_pauses: env_parse(&key("MAX_RATE_LIMIT_PAUSES"))
                .unwrap_or(defaults.max_rate_limit_pauses),
        }
    }
}

/// Process-level settings, read once from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    /// Operator config file; defaults to `{data_dir}/config.json`.
    pub operator_config_path: PathBuf,
    /// Snapshot file, or a directory searched for the newest `galaxy*.json[.gz]`.
    pub snapshot_path: PathBuf,
    /// Faction/control service base URL. Unset disables that source.
    pub control_api_url: Option<String>,
    /// Resource-site service base URL. Unset disables that source.
    pub resource_api_url: Option<String>,
    /// Tick service base URL. Unset leaves control staleness purely age-based.
    pub tick_api_url: Option<String>,
    pub control_policy: RatePolicy,
    pub resource_policy: RatePolicy,
    /// Systems per enrichment batch.
    pub batch_size: usize,
    /// Upper bound on systems enriched per source per run.
    pub enrich_limit: Option<usize>,
    pub schedule_interval: Duration,
    /// Time a stopping run gets before in-flight work is aborted.
    pub shutdown_grace: Duration,
    pub store_ping_attempts: u32,
}

impl AppConfig {
    pub const DEFAULT_DATABASE_URL: &'static str = "sqlite://data/huginn.db";

    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("HUGINN_DATA_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));
        let database_url = std::env::var("HUGINN_DATABASE_URL")
            .unwrap_or_else(|_| Self::DEFAULT_DATABASE_URL.to_string());
        let operator_config_path = std::env::var("HUGINN_CONFIG_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("config.json"));
        let snapshot_path = std::env::var("HUGINN_SNAPSHOT_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.clone());
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        let cfg = Self {
            database_url,
            data_dir,
            operator_config_path,
            snapshot_path,
            control_api_url: non_empty("HUGINN_CONTROL_API_URL"),
            resource_api_url: non_empty("HUGINN_RESOURCE_API_URL"),
            tick_api_url: non_empty("HUGINN_TICK_API_URL"),
            control_policy: RatePolicy::from_env("CONTROL", RatePolicy::default()),
            resource_policy: RatePolicy::from_env(
                "RESOURCE",
                RatePolicy {
                    max_concurrent: 2,
                    min_interval: Duration::from_secs(1),
                    ..RatePolicy::default()
                },
            ),
            batch_size: env_parse("HUGINN_BATCH_SIZE").unwrap_or(50),
            enrich_limit: match env_parse::<usize>("HUGINN_ENRICH_LIMIT") {
                Some(0) => None,
                Some(n) => Some(n),
                None => Some(500),
            },
            schedule_interval: Duration::from_secs(
                env_parse::<u64>("HUGINN_SCHEDULE_INTERVAL_MINUTES").unwrap_or(60) * 60,
            ),
            shutdown_grace: Duration::from_secs(
                env_parse("HUGINN_SHUTDOWN_GRACE_SECS").unwrap_or(120),
            ),
            store_ping_attempts: env_parse("HUGINN_STORE_PING_ATTEMPTS").unwrap_or(5),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::Config("HUGINN_DATABASE_URL is empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("HUGINN_BATCH_SIZE must be > 0".to_string()));
        }
        if self.schedule_interval.is_zero() {
            return Err(Error::Config(
                "HUGINN_SCHEDULE_INTERVAL_MINUTES must be > 0".to_string(),
            ));
        }
        if self.store_ping_attempts == 0 {
            return Err(Error::Config(
                "HUGINN_STORE_PING_ATTEMPTS must be > 0".to_string(),
            ));
        }
        self.control_policy.validate()?;
        self.resource_policy.validate()?;
        Ok(())
    }
}

/// Max staleness per source, in hours, as written in the operator file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxAgeHours {
    pub bulk: f64,
    pub control: f64,
    pub resource_sites: f64,
    pub candidacy: f64,
}

impl Default for MaxAgeHours {
    fn default() -> Self {
        Self {
            bulk: 168.0,
            control: 6.0,
            resource_sites: 24.0,
            candidacy: 3.0,
        }
    }
}

impl MaxAgeHours {
    /// Upper bound on any configured max age (ten years).
    pub const MAX_HOURS: f64 = 87_600.0;

    pub fn get(&self, source: FreshnessSource) -> f64 {
        match source {
            FreshnessSource::Bulk => self.bulk,
            FreshnessSource::Control => self.control,
            FreshnessSource::ResourceSites => self.resource_sites,
            FreshnessSource::Candidacy => self.candidacy,
        }
    }
}

/// Operator-editable settings (`data/config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub pledged_power: Option<String>,
    /// The scheduler only runs when this is explicitly enabled.
    pub enable_periodical_update: bool,
    pub proximity_radius_ly: f64,
    pub max_age_hours: MaxAgeHours,
    pub exploitable_states: Vec<ControlState>,
    pub tier_preference: Vec<ResourceTier>,
    pub require_ring: bool,
    pub excluded_systems: Vec<SystemId>,
    pub require_peaceful_faction: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pledged_power: None,
            enable_periodical_update: false,
            proximity_radius_ly: CandidacyConfig::DEFAULT_RADIUS_LY,
            max_age_hours: MaxAgeHours::default(),
            exploitable_states: CandidacyConfig::default_exploitable_states(),
            tier_preference: ResourceTier::ALL.to_vec(),
            require_ring: true,
            excluded_systems: Vec::new(),
            require_peaceful_faction: false,
        }
    }
}

impl OperatorConfig {
    /// Validate and freeze into the configuration a single run reads.
    pub fn to_run_config(&self) -> Result<RunConfig> {
        let raw = self
            .pledged_power
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                Error::Config("pledged power is not set (use `huginn power <name>`)".to_string())
            })?;
        let power = canonical_power(raw)
            .ok_or_else(|| Error::Config(format!("unknown power '{raw}'")))?;
        if !(self.proximity_radius_ly > 0.0) {
            return Err(Error::Config(format!(
                "proximity_radius_ly must be > 0, got {}",
                self.proximity_radius_ly
            )));
        }

        let mut max_age = [chrono::Duration::zero(); 4];
        for (slot, source) in max_age.iter_mut().zip([
            FreshnessSource::Bulk,
            FreshnessSource::Control,
            FreshnessSource::ResourceSites,
            FreshnessSource::Candidacy,
        ]) {
            let hours = self.max_age_hours.get(source);
            if !(hours.is_finite() && hours > 0.0) {
                return Err(Error::Config(format!(
                    "max_age_hours.{source} must be > 0, got {hours}"
                )));
            }
            if hours > MaxAgeHours::MAX_HOURS {
                return Err(Error::Config(format!(
                    "max_age_hours.{source} must be at most {}, got {hours}",
                    MaxAgeHours::MAX_HOURS
                )));
            }
            *slot = chrono::Duration::try_milliseconds((hours * 3_600_000.0) as i64).ok_or_else(
                || Error::Config(format!("max_age_hours.{source} is out of range: {hours}")),
            )?;
        }

        let candidacy = CandidacyConfig {
            pledged_power: power.to_string(),
            exploitable_states: self.exploitable_states.clone(),
            proximity_radius_ly: self.proximity_radius_ly,
            tier_preference: self.tier_preference.clone(),
            require_ring: self.require_ring,
            excluded_systems: self.excluded_systems.iter().copied().collect::<BTreeSet<_>>(),
            require_peaceful_faction: self.require_peaceful_faction,
        };
        candidacy.validate()?;

        Ok(RunConfig {
            candidacy,
            max_age: MaxAges {
                bulk: max_age[0],
                control: max_age[1],
                resource_sites: max_age[2],
                candidacy: max_age[3],
            },
            enable_periodical_update: self.enable_periodical_update,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAges {
    pub bulk: chrono::Duration,
    pub control: chrono::Duration,
    pub resource_sites: chrono::Duration,
    pub candidacy: chrono::Duration,
}

impl MaxAges {
    pub fn get(&self, source: FreshnessSource) -> chrono::Duration {
        match source {
            FreshnessSource::Bulk => self.bulk,
            FreshnessSource::Control => self.control,
            FreshnessSource::ResourceSites => self.resource_sites,
            FreshnessSource::Candidacy => self.candidacy,
        }
    }
}

/// Immutable settings for one run, built once per firing.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub candidacy: CandidacyConfig,
    pub max_age: MaxAges,
    pub enable_periodical_update: bool,
}

/// Where operator config is loaded from on each firing.
#[async_trait]
pub trait OperatorConfigSource: Send + Sync {
    async fn load(&self) -> Result<OperatorConfig>;
}

/// JSON file on disk. A missing file means "all defaults".
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[tracing::instrument(level = "debug", skip(self, cfg), fields(path = %self.path.display()))]
    pub async fn save(&self, cfg: &OperatorConfig) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("create config dir", e))?;
        }
        let body = serde_json::to_string_pretty(cfg)
            .map_err(|e| Error::backend("serialize operator config", e))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| Error::backend("write operator config", e))
    }
}

#[async_trait]
impl OperatorConfigSource for FileConfigSource {
    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<OperatorConfig> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("operator config missing; using defaults");
                return Ok(OperatorConfig::default());
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", self.path.display())))
    }
}

/// In-process config, replaceable between firings.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    cfg: RwLock<OperatorConfig>,
}

impl StaticConfigSource {
    pub fn new(cfg: OperatorConfig) -> Self {
        Self {
            cfg: RwLock::new(cfg),
        }
    }

    pub async fn set(&self, cfg: OperatorConfig) {
        *self.cfg.write().await = cfg;
    }
}

#[async_trait]
impl OperatorConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<OperatorConfig> {
        Ok(self.cfg.read().await.clone())
    }
}
