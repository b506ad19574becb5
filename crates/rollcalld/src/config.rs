use chrono::NaiveTime;
use rollcall_core::{MatchPolicy, Strictness};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Root directory for per-group ledgers and the system database.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Distance threshold and voting policy for matches.
    pub policy: MatchPolicy,
    /// Number of recognition worker threads.
    pub workers: usize,
    /// Capacity of the job queue in front of the workers.
    pub queue_depth: usize,
    pub transfer: TransferLimits,
    pub cutoffs: Cutoffs,
    /// Wall-clock times at which the current day's attendance is cleared.
    pub reset_times: Vec<NaiveTime>,
    pub auth_limit: RateLimit,
    pub submit_limit: RateLimit,
    pub mqtt: MqttConfig,
    /// Unix users allowed to call the administrative D-Bus methods.
    pub admin_uids: Vec<u32>,
    /// Serve the D-Bus interface on the session bus (development).
    pub dbus_session: bool,
}

/// Bounds on chunked transfers.
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    /// Ceiling on the declared fragment count.
    pub max_chunks: usize,
    /// Ceiling on cumulative fragment bytes in one session.
    pub max_payload_bytes: usize,
    /// Inactivity window after which the reaper discards a session.
    pub session_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_chunks: 1024,
            max_payload_bytes: 4 * 1024 * 1024,
            session_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(5),
        }
    }
}

/// Daily on-time cutoffs: `morning` applies before noon, `afternoon` after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoffs {
    pub morning: NaiveTime,
    pub afternoon: NaiveTime,
}

impl Default for Cutoffs {
    fn default() -> Self {
        Self {
            morning: NaiveTime::from_hms_opt(6, 45, 0).unwrap_or_default(),
            afternoon: NaiveTime::from_hms_opt(13, 15, 0).unwrap_or_default(),
        }
    }
}

/// Fixed-window rate limit.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub limit: u32,
    pub window: Duration,
}

pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("rollcall")
            });

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::default_model_dir());

        let strictness = std::env::var("ROLLCALL_MATCH_STRICTNESS")
            .ok()
            .and_then(|v| match v.parse::<Strictness>() {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring ROLLCALL_MATCH_STRICTNESS");
                    None
                }
            })
            .unwrap_or_default();

        let defaults = TransferLimits::default();
        let cutoffs = Cutoffs::default();

        Self {
            data_dir,
            model_dir,
            policy: MatchPolicy::new(
                env_parse("ROLLCALL_MATCH_THRESHOLD", rollcall_core::matcher::DEFAULT_THRESHOLD),
                strictness,
            ),
            workers: env_parse::<usize>("ROLLCALL_WORKERS", 4).max(1),
            queue_depth: env_parse::<usize>("ROLLCALL_QUEUE_DEPTH", 32).max(1),
            transfer: TransferLimits {
                max_chunks: env_parse("ROLLCALL_MAX_CHUNKS", defaults.max_chunks),
                max_payload_bytes: env_parse(
                    "ROLLCALL_MAX_PAYLOAD_BYTES",
                    defaults.max_payload_bytes,
                ),
                session_timeout: Duration::from_secs(env_parse("ROLLCALL_SESSION_TIMEOUT_SECS", 30)),
                reap_interval: Duration::from_secs(
                    env_parse::<u64>("ROLLCALL_REAP_INTERVAL_SECS", 5).max(1),
                ),
            },
            cutoffs: Cutoffs {
                morning: env_time("ROLLCALL_MORNING_CUTOFF", cutoffs.morning),
                afternoon: env_time("ROLLCALL_AFTERNOON_CUTOFF", cutoffs.afternoon),
            },
            reset_times: std::env::var("ROLLCALL_RESET_TIMES")
                .map(|v| parse_times(&v))
                .unwrap_or_default(),
            auth_limit: RateLimit {
                limit: env_parse("ROLLCALL_AUTH_LIMIT", 60),
                window: Duration::from_secs(env_parse("ROLLCALL_AUTH_WINDOW_SECS", 60)),
            },
            submit_limit: RateLimit {
                limit: env_parse("ROLLCALL_SUBMIT_LIMIT", 30),
                window: Duration::from_secs(env_parse("ROLLCALL_SUBMIT_WINDOW_SECS", 60)),
            },
            mqtt: MqttConfig {
                host: std::env::var("ROLLCALL_MQTT_HOST").unwrap_or_else(|_| "localhost".into()),
                port: env_parse("ROLLCALL_MQTT_PORT", 1883),
                client_id: std::env::var("ROLLCALL_MQTT_CLIENT_ID")
                    .unwrap_or_else(|_| "rollcalld".into()),
                username: std::env::var("ROLLCALL_MQTT_USERNAME").ok(),
                password: std::env::var("ROLLCALL_MQTT_PASSWORD").ok(),
            },
            admin_uids: std::env::var("ROLLCALL_ADMIN_UIDS")
                .map(|v| parse_uids(&v))
                .unwrap_or_else(|_| vec![0]),
            dbus_session: std::env::var("ROLLCALL_DBUS_SESSION")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    /// Path to the face detector model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("face_detector.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the signature model.
    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join("face_signature.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// SQLite database holding enrollment signatures and credentials.
    pub fn system_db_path(&self) -> PathBuf {
        self.data_dir.join("system.db")
    }

    /// Directory under which each group keeps its attendance ledger.
    pub fn groups_dir(&self) -> PathBuf {
        self.data_dir.join("groups")
    }
}

/// Parse a comma-separated list of `HH:MM` times, skipping malformed entries.
pub fn parse_times(value: &str) -> Vec<NaiveTime> {
    let mut times: Vec<NaiveTime> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match NaiveTime::parse_from_str(s, "%H:%M") {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(value = s, error = %e, "ignoring malformed reset time");
                None
            }
        })
        .collect();
    times.sort();
    times.dedup();
    times
}

fn env_time(key: &str, default: NaiveTime) -> NaiveTime {
    std::env::var(key)
        .ok()
        .and_then(|v| NaiveTime::parse_from_str(v.trim(), "%H:%M").ok())
        .unwrap_or(default)
}

/// Parse a comma-separated list of unix uids. Root is always an admin.
pub fn parse_uids(value: &str) -> Vec<u32> {
    let mut uids: Vec<u32> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(uid) => Some(uid),
            Err(e) => {
                tracing::warn!(value = s, error = %e, "ignoring malformed admin uid");
                None
            }
        })
        .chain(std::iter::once(0))
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    parse_or(key, std::env::var(key).ok().as_deref(), default)
}

fn parse_or<T: FromStr>(key: &str, raw: Option<&str>, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match raw.map(|v| v.trim().parse::<T>()) {
        Some(Ok(value)) => value,
        Some(Err(e)) => {
            tracing::warn!(key, error = %e, "ignoring out-of-range or malformed value");
            default
        }
        None => default,
    }
}
