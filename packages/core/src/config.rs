use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub measurement_api_url: String,
    pub worker_concurrency: usize,
    pub cache: CacheSettings,
}

/// TTLs and limits shared by the cache, aggregator and job coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    /// Lifetime of a per-item emissions entry.
    pub item_ttl: Duration,
    /// Lifetime of the site stats and heaviest-pages entries.
    pub aggregate_ttl: Duration,
    /// Lifetime of the untested-pages entry.
    pub untested_ttl: Duration,
    /// Safety timeout after which a processing lock is considered abandoned.
    pub lock_ttl: Duration,
    /// Age after which a measured item is scheduled for re-measurement.
    pub stale_after: Duration,
    pub max_heaviest_limit: usize,
    pub default_heaviest_limit: usize,
    pub max_untested_per_type: usize,
    /// Number of measurement snapshots retained per item.
    pub history_limit: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            item_ttl: Duration::from_secs(3600),
            aggregate_ttl: Duration::from_secs(3600),
            untested_ttl: Duration::from_secs(1800),
            lock_ttl: Duration::from_secs(300),
            stale_after: Duration::from_secs(7 * 24 * 3600),
            max_heaviest_limit: 100,
            default_heaviest_limit: 10,
            max_untested_per_type: 200,
            history_limit: 10,
        }
    }
}

impl CacheSettings {
    /// Resolve a caller-supplied top-N limit: 0 picks the default,
    /// anything above the maximum is clamped to it.
    pub fn clamp_heaviest_limit(&self, limit: usize) -> usize {
        let max = self.max_heaviest_limit.max(1);
        match limit {
            0 => self.default_heaviest_limit.clamp(1, max),
            n => n.min(max),
        }
    }

    fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let default_heaviest_limit =
            optional_var("DEFAULT_HEAVIEST_LIMIT", defaults.default_heaviest_limit)?;
        let max_heaviest_limit = optional_var("MAX_HEAVIEST_LIMIT", defaults.max_heaviest_limit)?;
        if max_heaviest_limit == 0 {
            return Err("MAX_HEAVIEST_LIMIT must be greater than zero".into());
        }
        if default_heaviest_limit > max_heaviest_limit {
            return Err("DEFAULT_HEAVIEST_LIMIT must not exceed MAX_HEAVIEST_LIMIT".into());
        }

        Ok(Self {
            item_ttl: optional_secs("CACHE_ITEM_TTL_SECONDS", defaults.item_ttl)?,
            aggregate_ttl: optional_secs("CACHE_AGGREGATE_TTL_SECONDS", defaults.aggregate_ttl)?,
            untested_ttl: optional_secs("CACHE_UNTESTED_TTL_SECONDS", defaults.untested_ttl)?,
            lock_ttl: optional_secs("PROCESSING_LOCK_TTL_SECONDS", defaults.lock_ttl)?,
            stale_after: optional_secs("STALE_AFTER_SECONDS", defaults.stale_after)?,
            max_heaviest_limit,
            default_heaviest_limit,
            max_untested_per_type: optional_var(
                "MAX_UNTESTED_PER_TYPE",
                defaults.max_untested_per_type,
            )?,
            history_limit: optional_var("HISTORY_LIMIT", defaults.history_limit)?,
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_env_with(None, None)
    }

    /// Like [`Config::from_env`], with command-line values taking
    /// precedence over the matching variables.
    pub fn from_env_with(
        database_url: Option<String>,
        measurement_api_url: Option<String>,
    ) -> Result<Self, String> {
        let database_url = match database_url {
            Some(url) => url,
            None => env::var("DATABASE_URL").map_err(|_| "DATABASE_URL is required")?,
        };

        let measurement_api_url = match measurement_api_url {
            Some(url) => url,
            None => env::var("MEASUREMENT_API_URL")
                .map_err(|_| "MEASUREMENT_API_URL is required")?,
        };

        let worker_concurrency = optional_var("WORKER_CONCURRENCY", 4usize)?;
        if worker_concurrency == 0 {
            return Err("WORKER_CONCURRENCY must be greater than zero".into());
        }

        Ok(Self {
            database_url,
            measurement_api_url,
            worker_concurrency,
            cache: CacheSettings::from_env()?,
        })
    }
}

fn optional_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn optional_secs(name: &str, default: Duration) -> Result<Duration, String> {
    optional_var(name, default.as_secs()).map(Duration::from_secs)
}
