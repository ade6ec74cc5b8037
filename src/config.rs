//! Core configuration knobs with conservative defaults.

/// Tunables shared by the command handler, dispatcher, and sync engine.
///
/// Injected at construction through the core builder; every field has a
/// default suitable for tests and small deployments.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Optimistic-concurrency retries before `ConcurrencyError`.
    pub max_retries: u32,
    /// Base of the jittered exponential backoff, milliseconds.
    pub backoff_base_ms: u64,
    /// Projection handler retries before dead-lettering an event.
    pub projection_max_retries: u32,
    /// Page size for sync download and catch-up reads.
    pub sync_batch_size: usize,
    /// Drift above this threshold is accepted but logged loudly.
    pub drift_warn_threshold_ms: i64,
    /// The single supported sync protocol version.
    pub protocol_version: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 10,
            projection_max_retries: 3,
            sync_batch_size: 100,
            drift_warn_threshold_ms: 300_000,
            protocol_version: 1,
        }
    }
}

/// Backoff delay for the given zero-based attempt: `base * 2^attempt` plus
/// full jitter of up to one base unit.
pub fn backoff_delay(config: &CoreConfig, attempt: u32) -> std::time::Duration {
    use rand::Rng;
    let exp = config.backoff_base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = rand::thread_rng().gen_range(0..=config.backoff_base_ms.max(1));
    std::time::Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.protocol_version, 1);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let config = CoreConfig::default();
        let early = backoff_delay(&config, 0);
        let late = backoff_delay(&config, 4);
        assert!(late >= early);
        // Bounded by base * 2^attempt + base.
        assert!(late.as_millis() <= (10 * 16 + 10) as u128);
    }
}
