use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{backoff::BackoffPolicy, errors::Error, Result};

/// Typed configuration for the `tgmon` process.
///
/// Values come from the environment, after an optional `.env` file in the
/// working directory has been merged in (existing variables win).
#[derive(Clone, Debug)]
pub struct Config {
    pub home: PathBuf,
    pub registry_path: PathBuf,
    pub log_json: bool,
    pub engine: EngineConfig,
}

/// Knobs consumed by the engine itself.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Dispatch queue capacity.
    pub queue_capacity: usize,
    /// How long a monitor waits on a full queue before dropping the oldest record.
    pub enqueue_timeout: Duration,
    /// Reconnect and send-retry backoff.
    pub backoff: BackoffPolicy,
    /// Delivery attempts per record, rate-limit waits excluded.
    pub send_max_attempts: u32,
    /// Minimum spacing between any two sends to the aggregator.
    pub send_min_interval: Duration,
    /// Minimum spacing between two sends to the same chat.
    pub send_per_chat_interval: Duration,
    /// How long the forwarder keeps draining after a stop signal.
    pub drain_grace: Duration,
    /// Consecutive connection failures before a monitor is reported unhealthy.
    pub supervision_threshold: u32,
    /// Long-poll timeout handed to the transport.
    pub poll_timeout: Duration,
    /// Broadcast buffer for the engine event stream.
    pub event_buffer: usize,
    /// Recently seen message keys remembered per account.
    pub dedup_window: usize,
    /// Cool-down before a failed watch resolution is attempted again.
    pub resolve_retry: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            enqueue_timeout: Duration::from_millis(5_000),
            backoff: BackoffPolicy::default(),
            send_max_attempts: 5,
            send_min_interval: Duration::from_millis(250),
            send_per_chat_interval: Duration::from_millis(1050),
            drain_grace: Duration::from_millis(10_000),
            supervision_threshold: 5,
            poll_timeout: Duration::from_secs(30),
            event_buffer: 1024,
            dedup_window: 1024,
            resolve_retry: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let home = env_path("TGMON_HOME").unwrap_or_else(|| PathBuf::from(".tgmon"));
        let registry_path =
            env_path("TGMON_REGISTRY_PATH").unwrap_or_else(|| home.join("registry.json"));
        let log_json = env_bool("TGMON_LOG_JSON").unwrap_or(false);

        let defaults = EngineConfig::default();

        let queue_capacity = env_usize("TGMON_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity);
        if queue_capacity == 0 {
            return Err(Error::Config(
                "TGMON_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }

        let backoff = BackoffPolicy {
            initial: env_millis("TGMON_BACKOFF_INITIAL_MS").unwrap_or(defaults.backoff.initial),
            max: env_millis("TGMON_BACKOFF_MAX_MS").unwrap_or(defaults.backoff.max),
            jitter: env_f64("TGMON_BACKOFF_JITTER")
                .map(|j| j.clamp(0.0, 1.0))
                .unwrap_or(defaults.backoff.jitter),
        };
        if backoff.initial > backoff.max {
            return Err(Error::Config(
                "TGMON_BACKOFF_INITIAL_MS must not exceed TGMON_BACKOFF_MAX_MS".to_string(),
            ));
        }

        let engine = EngineConfig {
            queue_capacity,
            enqueue_timeout: env_millis("TGMON_ENQUEUE_TIMEOUT_MS")
                .unwrap_or(defaults.enqueue_timeout),
            backoff,
            send_max_attempts: env_u32("TGMON_SEND_MAX_ATTEMPTS")
                .unwrap_or(defaults.send_max_attempts)
                .max(1),
            send_min_interval: env_millis("TGMON_SEND_MIN_INTERVAL_MS")
                .unwrap_or(defaults.send_min_interval),
            send_per_chat_interval: env_millis("TGMON_SEND_PER_CHAT_INTERVAL_MS")
                .unwrap_or(defaults.send_per_chat_interval),
            drain_grace: env_millis("TGMON_DRAIN_GRACE_MS").unwrap_or(defaults.drain_grace),
            supervision_threshold: env_u32("TGMON_SUPERVISION_THRESHOLD")
                .unwrap_or(defaults.supervision_threshold)
                .max(1),
            // Bot API takes the long-poll timeout as a 32-bit integer.
            poll_timeout: env_u32("TGMON_POLL_TIMEOUT_SECS")
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .unwrap_or(defaults.poll_timeout),
            event_buffer: env_usize("TGMON_EVENT_BUFFER")
                .unwrap_or(defaults.event_buffer)
                .max(1),
            dedup_window: env_usize("TGMON_DEDUP_WINDOW").unwrap_or(defaults.dedup_window),
            resolve_retry: env_u64("TGMON_RESOLVE_RETRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.resolve_retry),
        };

        Ok(Self {
            home,
            registry_path,
            log_json,
            engine,
        })
    }

    /// Create the state directory if it does not exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.home)?;
        if let Some(parent) = self.registry_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
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

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key)
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_millis)
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
