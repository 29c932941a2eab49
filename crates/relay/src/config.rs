// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use formcollab_common::types::ConflictStrategy;

use crate::sync::snapshot::SnapshotPolicy;

pub const DEFAULT_FIRST_WRITE_WINDOW_MS: u64 = 2_000;
pub const DEFAULT_ROOM_IDLE_GRACE_SECS: u64 = 300;
pub const DEFAULT_RECONNECT_GRACE_MS: u64 = 5_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_SNAPSHOT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_SNAPSHOT_RETRY_BASE_MS: u64 = 250;
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_DB_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Per-room behavior shared by every room the registry creates.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSettings {
    /// Strategy for rooms whose creator did not ask for one.
    pub default_strategy: ConflictStrategy,
    /// Debounce window for `first_write_wins`.
    pub first_write_window: Duration,
    /// How long an empty room stays in memory before eviction.
    pub idle_grace: Duration,
    /// How long a dropped connection keeps its participant alive.
    pub reconnect_grace: Duration,
    pub snapshot_policy: SnapshotPolicy,
    pub guest_can_edit: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            default_strategy: ConflictStrategy::default(),
            first_write_window: Duration::from_millis(DEFAULT_FIRST_WRITE_WINDOW_MS),
            idle_grace: Duration::from_secs(DEFAULT_ROOM_IDLE_GRACE_SECS),
            reconnect_grace: Duration::from_millis(DEFAULT_RECONNECT_GRACE_MS),
            snapshot_policy: SnapshotPolicy::default(),
            guest_can_edit: false,
        }
    }
}

/// PostgreSQL pool sizing. Only used when a database URL is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. `None` selects the in-memory backends.
    pub database_url: Option<String>,
    pub db_pool: PoolSettings,
    /// Log filter directive (e.g. `info`, `formcollab_relay=debug`).
    pub log_filter: String,
    /// Emit newline-delimited JSON log records instead of the text format.
    pub log_json: bool,
    pub rooms: RoomSettings,
    pub sweep_interval: Duration,
    pub snapshot_max_attempts: u32,
    pub snapshot_retry_base: Duration,
    pub idempotency_ttl: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FORMCOLLAB_RELAY_HOST` | `0.0.0.0` |
    /// | `FORMCOLLAB_RELAY_PORT` | `8080` |
    /// | `FORMCOLLAB_RELAY_DATABASE_URL` | *(none: in-memory)* |
    /// | `FORMCOLLAB_RELAY_DB_MIN_CONNECTIONS` | `2` |
    /// | `FORMCOLLAB_RELAY_DB_MAX_CONNECTIONS` | `20` |
    /// | `FORMCOLLAB_RELAY_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    /// | `FORMCOLLAB_RELAY_LOG_FILTER` | `info` |
    /// | `FORMCOLLAB_RELAY_LOG_JSON` | `false` |
    /// | `FORMCOLLAB_RELAY_DEFAULT_STRATEGY` | `last_write_wins` |
    /// | `FORMCOLLAB_RELAY_FIRST_WRITE_WINDOW_MS` | `2000` |
    /// | `FORMCOLLAB_RELAY_ROOM_IDLE_GRACE_SECS` | `300` |
    /// | `FORMCOLLAB_RELAY_RECONNECT_GRACE_MS` | `5000` |
    /// | `FORMCOLLAB_RELAY_SWEEP_INTERVAL_MS` | `1000` |
    /// | `FORMCOLLAB_RELAY_SNAPSHOT_INTERVAL_UPDATES` | `100` |
    /// | `FORMCOLLAB_RELAY_SNAPSHOT_INTERVAL_SECS` | `600` |
    /// | `FORMCOLLAB_RELAY_SNAPSHOT_MAX_ATTEMPTS` | `5` |
    /// | `FORMCOLLAB_RELAY_SNAPSHOT_RETRY_BASE_MS` | `250` |
    /// | `FORMCOLLAB_RELAY_GUEST_CAN_EDIT` | `false` |
    /// | `FORMCOLLAB_RELAY_IDEMPOTENCY_TTL_SECS` | `86400` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FORMCOLLAB_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "FORMCOLLAB_RELAY_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url =
            env("FORMCOLLAB_RELAY_DATABASE_URL").ok().filter(|url| !url.trim().is_empty());
        let min_connections =
            parse_or(&env, "FORMCOLLAB_RELAY_DB_MIN_CONNECTIONS", DEFAULT_DB_MIN_CONNECTIONS);
        let db_pool = PoolSettings {
            min_connections,
            max_connections: parse_or(
                &env,
                "FORMCOLLAB_RELAY_DB_MAX_CONNECTIONS",
                DEFAULT_DB_MAX_CONNECTIONS,
            )
            .max(min_connections)
            .max(1),
            acquire_timeout: Duration::from_secs(parse_or(
                &env,
                "FORMCOLLAB_RELAY_DB_ACQUIRE_TIMEOUT_SECS",
                DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
            )),
        };
        let log_filter = env("FORMCOLLAB_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let default_strategy = env("FORMCOLLAB_RELAY_DEFAULT_STRATEGY")
            .ok()
            .and_then(|raw| ConflictStrategy::parse(&raw))
            .unwrap_or_default();

        let defaults = SnapshotPolicy::default();
        let snapshot_policy = SnapshotPolicy {
            interval_updates: parse_or(
                &env,
                "FORMCOLLAB_RELAY_SNAPSHOT_INTERVAL_UPDATES",
                defaults.interval_updates,
            )
            .max(1),
            interval: Duration::from_secs(parse_or(
                &env,
                "FORMCOLLAB_RELAY_SNAPSHOT_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )),
        };

        let rooms = RoomSettings {
            default_strategy,
            first_write_window: Duration::from_millis(parse_or(
                &env,
                "FORMCOLLAB_RELAY_FIRST_WRITE_WINDOW_MS",
                DEFAULT_FIRST_WRITE_WINDOW_MS,
            )),
            idle_grace: Duration::from_secs(parse_or(
                &env,
                "FORMCOLLAB_RELAY_ROOM_IDLE_GRACE_SECS",
                DEFAULT_ROOM_IDLE_GRACE_SECS,
            )),
            reconnect_grace: Duration::from_millis(parse_or(
                &env,
                "FORMCOLLAB_RELAY_RECONNECT_GRACE_MS",
                DEFAULT_RECONNECT_GRACE_MS,
            )),
            snapshot_policy,
            guest_can_edit: parse_bool(&env, "FORMCOLLAB_RELAY_GUEST_CAN_EDIT"),
        };

        Self {
            listen_addr,
            database_url,
            db_pool,
            log_filter,
            log_json: parse_bool(&env, "FORMCOLLAB_RELAY_LOG_JSON"),
            rooms,
            sweep_interval: Duration::from_millis(
                parse_or(&env, "FORMCOLLAB_RELAY_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS)
                    .max(1),
            ),
            snapshot_max_attempts: parse_or(
                &env,
                "FORMCOLLAB_RELAY_SNAPSHOT_MAX_ATTEMPTS",
                DEFAULT_SNAPSHOT_MAX_ATTEMPTS,
            )
            .max(1),
            snapshot_retry_base: Duration::from_millis(parse_or(
                &env,
                "FORMCOLLAB_RELAY_SNAPSHOT_RETRY_BASE_MS",
                DEFAULT_SNAPSHOT_RETRY_BASE_MS,
            )),
            idempotency_ttl: Duration::from_secs(parse_or(
                &env,
                "FORMCOLLAB_RELAY_IDEMPOTENCY_TTL_SECS",
                DEFAULT_IDEMPOTENCY_TTL_SECS,
            )),
        }
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: FromStr,
{
    env(key).ok().and_then(|raw| raw.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool<F>(env: &F, key: &str) -> bool
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key)
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.db_pool, PoolSettings::default());
        assert_eq!(cfg.log_filter, "info");
        assert!(!cfg.log_json);
        assert_eq!(cfg.rooms, RoomSettings::default());
        assert_eq!(cfg.rooms.default_strategy, ConflictStrategy::LastWriteWins);
        assert_eq!(cfg.rooms.first_write_window, Duration::from_millis(2_000));
        assert_eq!(cfg.rooms.idle_grace, Duration::from_secs(300));
        assert_eq!(cfg.rooms.reconnect_grace, Duration::from_millis(5_000));
        assert!(!cfg.rooms.guest_can_edit);
        assert_eq!(cfg.sweep_interval, Duration::from_millis(1_000));
        assert_eq!(cfg.snapshot_max_attempts, 5);
        assert_eq!(cfg.snapshot_retry_base, Duration::from_millis(250));
        assert_eq!(cfg.idempotency_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_HOST", "127.0.0.1");
        m.insert("FORMCOLLAB_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn database_url_from_env() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_DATABASE_URL", "postgres://u:p@host/db");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db"));
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_DATABASE_URL", "  ");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn strategy_aliases_are_accepted() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_DEFAULT_STRATEGY", "fww");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.rooms.default_strategy, ConflictStrategy::FirstWriteWins);

        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_DEFAULT_STRATEGY", "bogus");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.rooms.default_strategy, ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn room_timings_override() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_FIRST_WRITE_WINDOW_MS", "500");
        m.insert("FORMCOLLAB_RELAY_ROOM_IDLE_GRACE_SECS", "0");
        m.insert("FORMCOLLAB_RELAY_RECONNECT_GRACE_MS", "0");
        m.insert("FORMCOLLAB_RELAY_SNAPSHOT_INTERVAL_UPDATES", "10");
        m.insert("FORMCOLLAB_RELAY_SNAPSHOT_INTERVAL_SECS", "30");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.rooms.first_write_window, Duration::from_millis(500));
        assert_eq!(cfg.rooms.idle_grace, Duration::ZERO);
        assert_eq!(cfg.rooms.reconnect_grace, Duration::ZERO);
        assert_eq!(cfg.rooms.snapshot_policy.interval_updates, 10);
        assert_eq!(cfg.rooms.snapshot_policy.interval, Duration::from_secs(30));
    }

    #[test]
    fn zero_snapshot_interval_is_clamped() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_SNAPSHOT_INTERVAL_UPDATES", "0");
        m.insert("FORMCOLLAB_RELAY_SNAPSHOT_MAX_ATTEMPTS", "0");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.rooms.snapshot_policy.interval_updates, 1);
        assert_eq!(cfg.snapshot_max_attempts, 1);
    }

    #[test]
    fn guest_can_edit_flag() {
        for (raw, expected) in [("true", true), ("1", true), ("YES", true), ("false", false), ("", false)]
        {
            let mut m = HashMap::new();
            m.insert("FORMCOLLAB_RELAY_GUEST_CAN_EDIT", raw);
            let cfg = RelayConfig::from_env_fn(env_from_map(m));
            assert_eq!(cfg.rooms.guest_can_edit, expected, "input {raw:?}");
        }
    }

    #[test]
    fn log_filter_override() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_LOG_FILTER", "debug,formcollab_relay=trace");
        m.insert("FORMCOLLAB_RELAY_LOG_JSON", "true");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,formcollab_relay=trace");
        assert!(cfg.log_json);
    }

    #[test]
    fn pool_max_never_drops_below_min() {
        let mut m = HashMap::new();
        m.insert("FORMCOLLAB_RELAY_DB_MIN_CONNECTIONS", "8");
        m.insert("FORMCOLLAB_RELAY_DB_MAX_CONNECTIONS", "4");
        m.insert("FORMCOLLAB_RELAY_DB_ACQUIRE_TIMEOUT_SECS", "3");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.db_pool.min_connections, 8);
        assert_eq!(cfg.db_pool.max_connections, 8);
        assert_eq!(cfg.db_pool.acquire_timeout, Duration::from_secs(3));
    }
}
