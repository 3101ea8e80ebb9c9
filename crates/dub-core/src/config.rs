use std::{
    env, fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

const DEFAULT_POLL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_RPS: u32 = 100;
const DEFAULT_POLL_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_DB_PATH: &str = "dnd-util-bot.sqlite3";

/// Knobs of the ingestion/dispatch pipeline. Validated once at startup.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub rate_limit_per_second: u32,
    pub poll_timeout: Duration,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub poll_retry_delay: Duration,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit_per_second == 0 {
            return Err(Error::Config(
                "rate limit must be at least 1 token per second".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker count must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let workers = default_worker_count();
        Self {
            rate_limit_per_second: DEFAULT_RATE_LIMIT_RPS,
            poll_timeout: Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS),
            worker_count: workers,
            queue_capacity: workers,
            poll_retry_delay: Duration::from_millis(DEFAULT_POLL_RETRY_DELAY_MS),
        }
    }
}

/// Typed configuration for the bot, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram_bot_token: String,
    /// Bot username without the leading `@`. `None` means "ask Telegram".
    pub bot_name: Option<String>,
    pub db_path: PathBuf,
    pub debug: bool,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (the process env in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let telegram_bot_token = lookup("DND_UTIL_TG_API_KEY").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "DND_UTIL_TG_API_KEY environment variable is required".to_string(),
            ));
        }

        let bot_name = lookup("DND_UTIL_BOT_NAME")
            .map(|s| s.trim().trim_start_matches('@').to_string())
            .and_then(non_empty);
        let db_path = lookup("DND_UTIL_DB_PATH")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let debug = lookup("DND_UTIL_DEBUG").map(|s| parse_bool(&s)).unwrap_or(false);

        let poll_timeout_secs = parse_num::<u64>(&lookup, "DND_UTIL_LONG_POLLING_TIMEOUT")?
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS);
        if poll_timeout_secs == 0 && !debug {
            return Err(Error::Config(
                "DND_UTIL_LONG_POLLING_TIMEOUT can't be zero outside debug mode".to_string(),
            ));
        }

        let rate_limit_per_second = parse_num::<u32>(&lookup, "DND_UTIL_RATE_LIMIT_RPS")?
            .unwrap_or(DEFAULT_RATE_LIMIT_RPS);
        let worker_count =
            parse_num::<usize>(&lookup, "DND_UTIL_WORKER_COUNT")?.unwrap_or_else(default_worker_count);
        let queue_capacity =
            parse_num::<usize>(&lookup, "DND_UTIL_QUEUE_CAPACITY")?.unwrap_or(worker_count);
        let poll_retry_delay = Duration::from_millis(
            parse_num::<u64>(&lookup, "DND_UTIL_POLL_RETRY_DELAY_MS")?
                .unwrap_or(DEFAULT_POLL_RETRY_DELAY_MS),
        );

        let pipeline = PipelineConfig {
            rate_limit_per_second,
            poll_timeout: Duration::from_secs(poll_timeout_secs),
            worker_count,
            queue_capacity,
            poll_retry_delay,
        };
        pipeline.validate()?;

        Ok(Self {
            telegram_bot_token,
            bot_name,
            db_path,
            debug,
            pipeline,
        })
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} is not a valid number: {raw}")))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn applies_defaults() {
        let cfg = Config::from_lookup(lookup_from(&[("DND_UTIL_TG_API_KEY", "token")])).unwrap();
        assert_eq!(cfg.telegram_bot_token, "token");
        assert_eq!(cfg.bot_name, None);
        assert_eq!(cfg.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert!(!cfg.debug);
        assert_eq!(cfg.pipeline.rate_limit_per_second, 100);
        assert_eq!(cfg.pipeline.poll_timeout, Duration::from_secs(60));
        assert!(cfg.pipeline.worker_count >= 1);
        assert_eq!(cfg.pipeline.queue_capacity, cfg.pipeline.worker_count);
    }

    #[test]
    fn reads_overrides_and_strips_bot_mention() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("DND_UTIL_TG_API_KEY", "token"),
            ("DND_UTIL_BOT_NAME", "@dnd_bot"),
            ("DND_UTIL_DB_PATH", "/var/lib/dub/ledger.db"),
            ("DND_UTIL_RATE_LIMIT_RPS", "10"),
            ("DND_UTIL_WORKER_COUNT", "3"),
            ("DND_UTIL_LONG_POLLING_TIMEOUT", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.bot_name.as_deref(), Some("dnd_bot"));
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/dub/ledger.db"));
        assert_eq!(cfg.pipeline.rate_limit_per_second, 10);
        assert_eq!(cfg.pipeline.worker_count, 3);
        assert_eq!(cfg.pipeline.queue_capacity, 3);
        assert_eq!(cfg.pipeline.poll_timeout, Duration::from_secs(5));
    }

    #[test]
    fn token_is_required() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let err = Config::from_lookup(lookup_from(&[
            ("DND_UTIL_TG_API_KEY", "token"),
            ("DND_UTIL_RATE_LIMIT_RPS", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("rate limit"));
    }

    #[test]
    fn rejects_negative_or_garbage_numbers() {
        for value in ["-1", "ten"] {
            let err = Config::from_lookup(lookup_from(&[
                ("DND_UTIL_TG_API_KEY", "token"),
                ("DND_UTIL_RATE_LIMIT_RPS", value),
            ]))
            .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{value}");
        }
    }

    #[test]
    fn zero_poll_timeout_only_allowed_in_debug() {
        let prod = Config::from_lookup(lookup_from(&[
            ("DND_UTIL_TG_API_KEY", "token"),
            ("DND_UTIL_LONG_POLLING_TIMEOUT", "0"),
        ]));
        assert!(prod.is_err());

        let debug = Config::from_lookup(lookup_from(&[
            ("DND_UTIL_TG_API_KEY", "token"),
            ("DND_UTIL_LONG_POLLING_TIMEOUT", "0"),
            ("DND_UTIL_DEBUG", "yes"),
        ]))
        .unwrap();
        assert!(debug.debug);
        assert_eq!(debug.pipeline.poll_timeout, Duration::ZERO);
    }
}
