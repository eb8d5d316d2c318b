use crate::util::env as env_util;

/// Tunables for the harvest pipeline. Defaults mirror production settings;
/// every field can be overridden through the environment.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Active platform shards, e.g. EUW1, NA1, KR.
    pub platforms: Vec<String>,
    /// Backlog sections remembered by the gate.
    pub sections: usize,
    /// Identifiers per backlog section.
    pub section_size: usize,
    /// Claim lock TTL; a crashed claimer's rows become reclaimable after this.
    pub lock_ttl_secs: i64,
    /// Result flush cadence.
    pub flush_secs: u64,
    /// Worker pool bounds and the queue depth one worker is expected to cover.
    pub worker_floor: usize,
    pub worker_ceiling: usize,
    pub tasks_per_worker: i64,
    /// How often the pool supervisor re-evaluates the desired size.
    pub resize_secs: u64,
    /// Match-history pagination bounds.
    pub match_cap: i64,
    pub page_size: i64,
    pub history_days: i64,
    /// Optional ranked-queue filter forwarded to the listing endpoint.
    pub queue_filter: Option<i32>,
    /// Queue lease and idle polling.
    pub visibility_timeout_secs: i32,
    pub poll_interval_secs: u64,
    /// Gate sleep when the claim comes back empty.
    pub starve_sleep_secs: u64,
    /// Shutdown grace window for in-flight work.
    pub grace_secs: u64,
    /// Forwarding endpoint that injects upstream credentials.
    pub proxy_base: String,
    pub request_timeout_secs: u64,
    /// Store pool size shared by a process's platforms.
    pub max_connections: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            platforms: vec!["EUW1".into()],
            sections: 8,
            section_size: 1000,
            lock_ttl_secs: 600,
            flush_secs: 30,
            worker_floor: 1,
            worker_ceiling: 10,
            tasks_per_worker: 50,
            resize_secs: 5,
            match_cap: 1000,
            page_size: 100,
            history_days: 14,
            queue_filter: None,
            visibility_timeout_secs: 60,
            poll_interval_secs: 2,
            starve_sleep_secs: 10,
            grace_secs: 10,
            proxy_base: "http://proxy:8000".into(),
            request_timeout_secs: 30,
            max_connections: 20,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(raw) = env_util::env_opt("HARVEST_PLATFORMS") {
            let parsed = parse_platform_list(&raw);
            if !parsed.is_empty() {
                cfg.platforms = parsed;
            }
        }
        cfg.sections = env_util::env_parse("HARVEST_SECTIONS", cfg.sections).max(2);
        cfg.section_size = env_util::env_parse("HARVEST_SECTION_SIZE", cfg.section_size).max(1);
        cfg.lock_ttl_secs = env_util::env_parse("HARVEST_LOCK_TTL_SECS", cfg.lock_ttl_secs).max(1);
        cfg.flush_secs = env_util::env_parse("HARVEST_FLUSH_SECS", cfg.flush_secs).max(1);
        cfg.worker_floor = env_util::env_parse("HARVEST_WORKER_FLOOR", cfg.worker_floor).max(1);
        cfg.worker_ceiling = env_util::env_parse("HARVEST_WORKER_CEILING", cfg.worker_ceiling)
            .max(cfg.worker_floor);
        cfg.tasks_per_worker =
            env_util::env_parse("HARVEST_TASKS_PER_WORKER", cfg.tasks_per_worker).max(1);
        cfg.resize_secs = env_util::env_parse("HARVEST_RESIZE_SECS", cfg.resize_secs).max(1);
        cfg.match_cap = env_util::env_parse("HARVEST_MATCH_CAP", cfg.match_cap).max(1);
        cfg.page_size = env_util::env_parse("HARVEST_PAGE_SIZE", cfg.page_size).clamp(1, 100);
        cfg.history_days = env_util::env_parse("HARVEST_HISTORY_DAYS", cfg.history_days).max(1);
        cfg.queue_filter = env_util::env_parse_opt("HARVEST_QUEUE_FILTER");
        cfg.visibility_timeout_secs =
            env_util::env_parse("HARVEST_QUEUE_VT_SECS", cfg.visibility_timeout_secs).max(1);
        cfg.poll_interval_secs =
            env_util::env_parse("HARVEST_QUEUE_POLL_SECS", cfg.poll_interval_secs).max(1);
        cfg.starve_sleep_secs =
            env_util::env_parse("HARVEST_STARVE_SLEEP_SECS", cfg.starve_sleep_secs).max(1);
        cfg.grace_secs = env_util::env_parse("HARVEST_GRACE_SECS", cfg.grace_secs);
        if let Some(v) = env_util::env_opt("HARVEST_PROXY_BASE") {
            cfg.proxy_base = v.trim_end_matches('/').to_string();
        }
        cfg.request_timeout_secs =
            env_util::env_parse("HARVEST_REQUEST_TIMEOUT_SECS", cfg.request_timeout_secs).max(1);
        cfg.max_connections = env_util::env_parse("HARVEST_DB_POOL", cfg.max_connections).max(1);
        cfg
    }

    /// Upper bound the gate will ever hand to a single claim call.
    pub fn claim_batch(&self) -> i64 {
        (self.sections * self.section_size) as i64
    }
}

/// Platform names end up in queue names and SQL bind values; restrict them to
/// ASCII alphanumerics so nothing downstream needs escaping.
pub fn is_valid_platform(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

pub fn parse_platform_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim().to_ascii_uppercase())
        .filter(|p| is_valid_platform(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_platform_list() {
        let list = parse_platform_list(" euw1, na1 ,,KR ");
        assert_eq!(list, vec!["EUW1", "NA1", "KR"]);
    }

    #[test]
    fn rejects_unsafe_platform_names() {
        assert!(!is_valid_platform(""));
        assert!(!is_valid_platform("euw1;drop"));
        assert!(!is_valid_platform("na 1"));
        assert!(is_valid_platform("EUW1"));
    }

    #[test]
    fn claim_batch_covers_all_sections() {
        let cfg = HarvestConfig::default();
        assert_eq!(cfg.claim_batch(), (cfg.sections * cfg.section_size) as i64);
    }
}
