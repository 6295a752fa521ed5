use crate::llm::LlmConfig;
use crate::scheduler::SchedulerConfig;
use crate::scraper::OlxConfig;
use crate::scraping::ScrapeConfig;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScraperBackend {
    Demo,
    Olx,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub per_sec: f64,
    pub capacity: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_sec: 5.0,
            capacity: 10.0,
        }
    }
}

/// A user seeded at startup so the API is usable without registering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedUser {
    pub email: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub body_limit: usize,
    pub scheduler_enabled: bool,
    pub scheduler: SchedulerConfig,
    pub scrape: ScrapeConfig,
    pub scraper_backend: ScraperBackend,
    pub olx: OlxConfig,
    pub supabase: Option<SupabaseConfig>,
    pub redis_url: Option<String>,
    pub task_ttl_secs: u64,
    pub queue_capacity: usize,
    pub llm: LlmConfig,
    pub rate_limit: RateLimitConfig,
    pub seed_users: Vec<SeedUser>,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

impl AppConfig {
    /// Reads the process environment; call after `dotenvy::dotenv()`.
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        config.llm = LlmConfig::from_env();
        config
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let secs = |key: &str, default: u64| Duration::from_secs(parse_u64(key, default));
        let non_empty = |key: &str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let scheduler = SchedulerConfig {
            poll_interval: secs("SCRAPE_POLL_INTERVAL_SECS", 3600),
            error_backoff: secs("SCRAPE_ERROR_BACKOFF_SECS", 300),
            max_concurrent: parse_u64("MAX_CONCURRENT_SCRAPES", 5) as usize,
        };
        let scrape = ScrapeConfig {
            timeout: secs("SCRAPE_TIMEOUT_SECS", 120),
            ..ScrapeConfig::default()
        };

        let scraper_backend = match non_empty("SCRAPER_BACKEND").as_deref() {
            None | Some("demo") => ScraperBackend::Demo,
            Some("olx") => ScraperBackend::Olx,
            Some(other) => {
                warn!(
                    target = "buysmart.config",
                    backend = other,
                    "unknown SCRAPER_BACKEND, using demo"
                );
                ScraperBackend::Demo
            }
        };
        let olx = OlxConfig {
            base_url: non_empty("OLX_BASE_URL").unwrap_or_else(|| OlxConfig::default().base_url),
            max_pages: parse_u64("OLX_MAX_PAGES", 3) as u32,
        };

        let supabase = non_empty("SUPABASE_URL").zip(
            non_empty("SUPABASE_SERVICE_ROLE_KEY")
                .or_else(|| non_empty("SUPABASE_SERVICE_KEY"))
                .or_else(|| non_empty("SUPABASE_KEY")),
        );

        let rate_limit = RateLimitConfig {
            per_sec: get("RATE_LIMIT_PER_SEC")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v > 0.0)
                .unwrap_or(5.0),
            capacity: get("RATE_LIMIT_CAPACITY")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v >= 1.0)
                .unwrap_or(10.0),
        };

        Self {
            port: get("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            body_limit: parse_u64("REQUEST_MAX_BYTES", 256 * 1024) as usize,
            scheduler_enabled: get("SCHEDULER_ENABLED")
                .map(|v| {
                    !matches!(
                        v.trim().to_ascii_lowercase().as_str(),
                        "0" | "false" | "no" | "off"
                    )
                })
                .unwrap_or(true),
            scheduler,
            scrape,
            scraper_backend,
            olx,
            supabase: supabase.map(|(url, service_key)| SupabaseConfig { url, service_key }),
            redis_url: non_empty("REDIS_URL"),
            task_ttl_secs: parse_u64("TASK_TTL_SECS", 3600),
            queue_capacity: parse_u64("QUEUE_CAPACITY", 64) as usize,
            llm: LlmConfig::default(),
            rate_limit,
            seed_users: parse_seed_users(
                get("DEMO_API_KEYS")
                    .as_deref()
                    .unwrap_or("demo@buysmart.local:demo-key"),
            ),
            metrics_key: non_empty("METRICS_KEY"),
            openapi_key: non_empty("OPENAPI_KEY"),
        }
    }
}

/// `email:key` pairs separated by commas.
fn parse_seed_users(raw: &str) -> Vec<SeedUser> {
    let mut users = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.split_once(':') {
            Some((email, key)) if !email.trim().is_empty() && !key.trim().is_empty() => {
                users.push(SeedUser {
                    email: email.trim().to_string(),
                    api_key: key.trim().to_string(),
                })
            }
            _ => warn!(
                target = "buysmart.config",
                "ignored malformed DEMO_API_KEYS entry: {token}"
            ),
        }
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = config(&[]);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.scheduler.poll_interval, Duration::from_secs(3600));
        assert_eq!(cfg.scheduler.error_backoff, Duration::from_secs(300));
        assert_eq!(cfg.scheduler.max_concurrent, 5);
        assert_eq!(cfg.scrape.timeout, Duration::from_secs(120));
        assert_eq!(cfg.scraper_backend, ScraperBackend::Demo);
        assert!(cfg.scheduler_enabled);
        assert!(cfg.supabase.is_none());
        assert_eq!(cfg.seed_users.len(), 1);
    }

    #[test]
    fn overrides_and_invalid_values() {
        let cfg = config(&[
            ("SCRAPE_POLL_INTERVAL_SECS", "60"),
            ("MAX_CONCURRENT_SCRAPES", "0"),
            ("SCRAPER_BACKEND", "olx"),
            ("SCHEDULER_ENABLED", "false"),
            ("SUPABASE_URL", "https://db.example.co"),
            ("SUPABASE_SERVICE_ROLE_KEY", "secret"),
        ]);
        assert_eq!(cfg.scheduler.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.scheduler.max_concurrent, 5);
        assert_eq!(cfg.scraper_backend, ScraperBackend::Olx);
        assert!(!cfg.scheduler_enabled);
        assert_eq!(cfg.supabase.map(|s| s.service_key).as_deref(), Some("secret"));
    }

    #[test]
    fn seed_users_skip_malformed_entries() {
        let users = parse_seed_users("a@x.io:k1, broken ,b@x.io:k2,:k3");
        assert_eq!(
            users,
            vec![
                SeedUser {
                    email: "a@x.io".into(),
                    api_key: "k1".into()
                },
                SeedUser {
                    email: "b@x.io".into(),
                    api_key: "k2".into()
                },
            ]
        );
    }
}
