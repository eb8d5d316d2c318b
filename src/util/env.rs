//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        crate::env_boot::ensure_dotenv();
    });
}

/// Get required env var; error if missing.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    init_env();
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Optional parsed value.
pub fn env_parse_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    init_env();
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        Err(_) => default,
    }
}

/// Database DSN: prefer the harvester-specific variable, fall back to the
/// generic one.
pub fn db_url() -> anyhow::Result<String> {
    init_env();
    if let Some(v) = env_opt("HARVEST_DB_URL") {
        return Ok(v);
    }
    if let Some(v) = env_opt("DATABASE_URL") {
        return Ok(v);
    }
    anyhow::bail!("no database DSN configured (set HARVEST_DB_URL or DATABASE_URL)")
}

/// DSN for the LISTEN connection. Poolers in transaction mode cannot carry
/// LISTEN, so a session-mode DSN may be supplied separately.
pub fn listen_url() -> Option<String> {
    init_env();
    env_opt("HARVEST_LISTEN_URL")
        .or_else(|| env_opt("HARVEST_DB_URL"))
        .or_else(|| env_opt("DATABASE_URL"))
}
