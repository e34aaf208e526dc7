use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::env;

/// All runtime knobs, read from environment variables with defaults that
/// match production. Tests construct this directly to avoid env races.
#[derive(Debug, Clone)]
pub struct Config {
    // Agent
    pub ai_api_key: Option<String>,
    pub ai_api_url: String,
    pub ai_model: String,
    pub agent_timeout_secs: u64,

    // WhatsApp gateway
    pub whatsapp_base_url: Option<String>,
    pub whatsapp_instance: String,
    pub whatsapp_api_key: String,

    // Chatwoot
    pub chatwoot_base_url: Option<String>,
    pub chatwoot_account_id: String,
    pub chatwoot_api_token: String,
    pub transport_timeout_secs: u64,

    // Admission
    pub user_rate_max: usize,
    pub user_rate_window_secs: u64,
    pub ip_rate_max: usize,
    pub ip_rate_window_secs: u64,
    pub global_rate_max: usize,
    pub global_rate_window_secs: u64,
    pub dedup_ttl_secs: u64,
    pub queue_soft_cap: usize,

    // Burst buffer
    pub coalesce_window_ms: u64,
    pub coalesce_max_wait_ms: u64,
    pub burst_sweep_ms: u64,

    // Worker pool
    pub worker_pool_min: usize,
    pub worker_pool_max: usize,
    pub scale_interval_secs: u64,
    pub scale_cooldown_secs: u64,
    pub target_latency_ms: u64,
    pub drain_timeout_secs: u64,

    // Follow-ups
    pub followup_tz: Tz,
    pub followup_start_hour: u32,
    pub followup_end_hour: u32,
    /// Allowed weekdays, chrono numbering Mon=0..Sun=6.
    pub followup_weekdays: Vec<u32>,
    pub followup_tick_secs: u64,
    pub migration_mode_until: Option<DateTime<Utc>>,

    // Context store
    pub l1_capacity: usize,
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ai_api_key: None,
            ai_api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            ai_model: "gpt-4o-mini".to_string(),
            agent_timeout_secs: 30,

            whatsapp_base_url: None,
            whatsapp_instance: "main".to_string(),
            whatsapp_api_key: String::new(),

            chatwoot_base_url: None,
            chatwoot_account_id: "1".to_string(),
            chatwoot_api_token: String::new(),
            transport_timeout_secs: 10,

            user_rate_max: 10,
            user_rate_window_secs: 60,
            ip_rate_max: 50,
            ip_rate_window_secs: 60,
            global_rate_max: 1000,
            global_rate_window_secs: 60,
            dedup_ttl_secs: 600,
            queue_soft_cap: 500,

            coalesce_window_ms: 5000,
            coalesce_max_wait_ms: 10_000,
            burst_sweep_ms: 500,

            worker_pool_min: 2,
            worker_pool_max: 8,
            scale_interval_secs: 30,
            scale_cooldown_secs: 30,
            target_latency_ms: 10_000,
            drain_timeout_secs: 30,

            followup_tz: chrono_tz::America::Argentina::Cordoba,
            followup_start_hour: 9,
            followup_end_hour: 21,
            // Monday..Saturday
            followup_weekdays: vec![0, 1, 2, 3, 4, 5],
            followup_tick_secs: 60,
            migration_mode_until: None,

            l1_capacity: 500,
            l1_ttl_secs: 300,
            l2_ttl_secs: 3600,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key)
        && let Ok(n) = val.parse::<T>()
    {
        *target = n;
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.ai_api_key = env_opt("AI_API_KEY");
        if let Some(url) = env_opt("AI_API_URL") {
            config.ai_api_url = url;
        }
        if let Some(model) = env_opt("AI_MODEL") {
            config.ai_model = model;
        }
        env_parse("AGENT_TIMEOUT_SECS", &mut config.agent_timeout_secs);

        config.whatsapp_base_url = env_opt("WHATSAPP_BASE_URL");
        if let Some(v) = env_opt("WHATSAPP_INSTANCE") {
            config.whatsapp_instance = v;
        }
        if let Some(v) = env_opt("WHATSAPP_API_KEY") {
            config.whatsapp_api_key = v;
        }

        config.chatwoot_base_url = env_opt("CHATWOOT_BASE_URL");
        if let Some(v) = env_opt("CHATWOOT_ACCOUNT_ID") {
            config.chatwoot_account_id = v;
        }
        if let Some(v) = env_opt("CHATWOOT_API_TOKEN") {
            config.chatwoot_api_token = v;
        }
        env_parse("TRANSPORT_TIMEOUT_SECS", &mut config.transport_timeout_secs);

        env_parse("RATE_LIMIT_USER", &mut config.user_rate_max);
        env_parse("RATE_LIMIT_IP", &mut config.ip_rate_max);
        env_parse("RATE_LIMIT_GLOBAL", &mut config.global_rate_max);
        env_parse("DEDUP_TTL_SECS", &mut config.dedup_ttl_secs);
        env_parse("QUEUE_SOFT_CAP", &mut config.queue_soft_cap);

        env_parse("COALESCE_WINDOW_MS", &mut config.coalesce_window_ms);
        // Max wait defaults to twice the window unless set explicitly.
        config.coalesce_max_wait_ms = config.coalesce_window_ms * 2;
        env_parse("COALESCE_MAX_WAIT_MS", &mut config.coalesce_max_wait_ms);
        env_parse("BURST_SWEEP_MS", &mut config.burst_sweep_ms);

        env_parse("WORKER_POOL_MIN", &mut config.worker_pool_min);
        env_parse("WORKER_POOL_MAX", &mut config.worker_pool_max);
        if config.worker_pool_max < config.worker_pool_min {
            config.worker_pool_max = config.worker_pool_min;
        }
        env_parse("SCALE_INTERVAL_SECS", &mut config.scale_interval_secs);
        env_parse("SCALE_COOLDOWN_SECS", &mut config.scale_cooldown_secs);
        env_parse("TARGET_LATENCY_MS", &mut config.target_latency_ms);
        env_parse("DRAIN_TIMEOUT_SECS", &mut config.drain_timeout_secs);

        if let Ok(tz) = env::var("FOLLOWUP_TZ")
            && let Ok(parsed) = tz.parse::<Tz>()
        {
            config.followup_tz = parsed;
        }
        env_parse("FOLLOWUP_START_HOUR", &mut config.followup_start_hour);
        env_parse("FOLLOWUP_END_HOUR", &mut config.followup_end_hour);
        env_parse("FOLLOWUP_TICK_SECS", &mut config.followup_tick_secs);
        if let Ok(raw) = env::var("MIGRATION_MODE_UNTIL")
            && let Ok(ts) = DateTime::parse_from_rfc3339(&raw)
        {
            config.migration_mode_until = Some(ts.with_timezone(&Utc));
        }

        env_parse("CONTEXT_L1_CAPACITY", &mut config.l1_capacity);
        env_parse("CONTEXT_L1_TTL_SECS", &mut config.l1_ttl_secs);
        env_parse("CONTEXT_L2_TTL_SECS", &mut config.l2_ttl_secs);

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.worker_pool_min, 2);
        assert_eq!(config.worker_pool_max, 8);
        assert_eq!(config.coalesce_max_wait_ms, config.coalesce_window_ms * 2);
        assert_eq!(config.followup_tz.name(), "America/Argentina/Cordoba");
        assert_eq!(config.followup_weekdays, vec![0, 1, 2, 3, 4, 5]);
    }
}
