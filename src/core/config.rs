//! Engine configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::core::signature::FingerprintLimits;

/// Tunables for an [`Engine`](crate::Engine).
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Synthesis attempts per call before giving up (default: 3)
    pub max_attempts: u32,
    /// Deadline for a single backend call (default: 60s)
    pub synthesis_timeout: Duration,
    /// First retry delay after a backend failure; doubles per attempt (default: 200ms)
    pub backoff_base: Duration,
    /// Upper bound on a single backoff sleep (default: 5s)
    pub backoff_cap: Duration,
    /// How long a synthesis claim may be held before others take it over. `None` derives
    /// it from the attempt budget, see [`EngineConfig::claim_ttl`] (default: `None`)
    pub claim_ttl: Option<Duration>,
    /// Interpreter step budget per invocation (default: 1_000_000)
    pub eval_fuel: u64,
    /// List elements sampled per fingerprint (default: 3)
    pub sample_limit: usize,
    /// Object keys recorded per fingerprint (default: 16)
    pub key_limit: usize,
    /// Nesting depth explored per fingerprint (default: 6)
    pub depth_limit: usize,
    /// Characters of each argument shown to the backend (default: 200)
    pub sample_chars: usize,
    /// Directory of the on-disk cache and traces (default: .lambdai)
    pub cache_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let limits = FingerprintLimits::default();
        Self {
            max_attempts: 3,
            synthesis_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(5),
            claim_ttl: None,
            eval_fuel: 1_000_000,
            sample_limit: limits.sample,
            key_limit: limits.keys,
            depth_limit: limits.depth,
            sample_chars: 200,
            cache_dir: PathBuf::from(".lambdai"),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}: cannot parse '{}'", name, raw);
            None
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LAMBDAI_*` environment variables. Unparsable values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<u32>("LAMBDAI_MAX_ATTEMPTS") {
            config.max_attempts = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("LAMBDAI_SYNTHESIS_TIMEOUT_SECS") {
            config.synthesis_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("LAMBDAI_CLAIM_TTL_SECS") {
            config.claim_ttl = Some(Duration::from_secs(secs));
        }
        if let Some(n) = env_parse::<usize>("LAMBDAI_SAMPLE_LIMIT") {
            config.sample_limit = n;
        }
        if let Some(fuel) = env_parse::<u64>("LAMBDAI_EVAL_FUEL") {
            config.eval_fuel = fuel;
        }
        if let Ok(dir) = std::env::var("LAMBDAI_CACHE_DIR") {
            if !dir.trim().is_empty() {
                config.cache_dir = PathBuf::from(dir);
            }
        }
        config
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_synthesis_timeout(mut self, timeout: Duration) -> Self {
        self.synthesis_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = Some(ttl);
        self
    }

    pub fn with_eval_fuel(mut self, fuel: u64) -> Self {
        self.eval_fuel = fuel;
        self
    }

    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn fingerprint_limits(&self) -> FingerprintLimits {
        FingerprintLimits {
            sample: self.sample_limit,
            keys: self.key_limit,
            depth: self.depth_limit,
        }
    }

    /// Effective claim lifetime. Unless set explicitly, it covers a holder that spends
    /// every attempt on a timed-out backend call followed by a full backoff.
    pub fn claim_ttl(&self) -> Duration {
        self.claim_ttl.unwrap_or_else(|| {
            self.synthesis_timeout
                .saturating_add(self.backoff_cap)
                .saturating_mul(self.max_attempts.max(1))
        })
    }

    /// Sleep before retrying after the `attempt`-th (1-based) backend failure.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.claim_ttl(), Duration::from_secs(3 * 65));
        assert_eq!(config.eval_fuel, 1_000_000);
        assert_eq!(config.fingerprint_limits(), FingerprintLimits::default());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = EngineConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
        assert_eq!(config.backoff_for(64), Duration::from_millis(350));
    }

    #[test]
    fn test_claim_ttl_outlasts_a_slow_holder() {
        let config = EngineConfig::default()
            .with_max_attempts(5)
            .with_synthesis_timeout(Duration::from_secs(10))
            .with_backoff(Duration::from_millis(100), Duration::from_secs(2));
        let worst_case = 5 * (Duration::from_secs(10) + Duration::from_secs(2));
        assert!(config.claim_ttl() >= worst_case);

        let pinned = config.with_claim_ttl(Duration::from_secs(1));
        assert_eq!(pinned.claim_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_env_overrides_and_ignores_garbage() {
        // SAFETY: no other unit test reads or writes the process environment.
        unsafe {
            std::env::set_var("LAMBDAI_MAX_ATTEMPTS", "0");
            std::env::set_var("LAMBDAI_SYNTHESIS_TIMEOUT_SECS", "7");
            std::env::set_var("LAMBDAI_CLAIM_TTL_SECS", "not a number");
            std::env::set_var("LAMBDAI_EVAL_FUEL", "500");
            std::env::set_var("LAMBDAI_CACHE_DIR", "  ");
        }
        let config = EngineConfig::from_env();
        unsafe {
            for name in [
                "LAMBDAI_MAX_ATTEMPTS",
                "LAMBDAI_SYNTHESIS_TIMEOUT_SECS",
                "LAMBDAI_CLAIM_TTL_SECS",
                "LAMBDAI_EVAL_FUEL",
                "LAMBDAI_CACHE_DIR",
            ] {
                std::env::remove_var(name);
            }
        }

        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.synthesis_timeout, Duration::from_secs(7));
        assert_eq!(config.claim_ttl, None);
        assert_eq!(config.eval_fuel, 500);
        assert_eq!(config.cache_dir, PathBuf::from(".lambdai"));
    }

    #[test]
    fn test_builder_clamps_attempts() {
        let config = EngineConfig::default().with_max_attempts(0);
        assert_eq!(config.max_attempts, 1);
    }
}
