//! Client identity and the tunables of every synchronization component.
//!
//! Each component takes its own tunables struct so it can be constructed
//! in isolation. The defaults are the production values.

use std::time::Duration;

use url::Url;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Sent as `User-Agent` when connecting to the relay.
    pub user_agent: String,

    /// Stable per-machine identifier sent with `REGISTER_SESSION`.
    pub client_id: Uuid,

    /// Name shown to listeners.
    pub dj_name: String,

    /// Relay websocket endpoint.
    pub relay_url: Url,

    pub reliability: ReliabilityConfig,
    pub flush: FlushConfig,
    pub dedup: DedupConfig,
    pub likes: LikeBatchConfig,
    pub reconnect: ReconnectConfig,
}

/// Acknowledgment and retry policy of reliable messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// How long to wait for `ACK` or `NACK` after each send.
    pub ack_timeout: Duration,

    /// Number of re-sends after the original send.
    pub max_retries: u32,

    /// Delay before the n-th retry. Indices past the end use the last value.
    pub retry_delays: Vec<Duration>,
}

/// Pacing and circuit breaking of the durable queue flush.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,

    /// Factor applied to the delay once per `step` messages.
    pub growth: f64,
    pub step: usize,

    /// Penalty per consecutive failure.
    pub base_retry_delay: Duration,

    /// Consecutive failures that abort the flush.
    pub failure_threshold: u32,
}

/// Windows of the play-record deduplicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DedupConfig {
    pub window: Duration,

    /// Minimum time between two recorded plays of the same track.
    pub min_replay_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LikeBatchConfig {
    /// Likes that flush a batch immediately.
    pub threshold: u32,

    /// Time after the first like of a batch until it is flushed.
    pub delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(5_000),
            max_retries: 3,
            retry_delays: vec![
                Duration::from_millis(1_000),
                Duration::from_millis(2_000),
                Duration::from_millis(4_000),
            ],
        }
    }
}

impl ReliabilityConfig {
    /// Delay before retry number `retry_count` (zero-based), clamped to the
    /// last configured delay.
    #[must_use]
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let index = usize::try_from(retry_count).unwrap_or(usize::MAX);
        self.retry_delays
            .get(index)
            .or_else(|| self.retry_delays.last())
            .copied()
            .unwrap_or(self.ack_timeout)
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2_000),
            growth: 1.2,
            step: 5,
            base_retry_delay: Duration::from_millis(1_000),
            failure_threshold: 3,
        }
    }
}

impl FlushConfig {
    /// Delay after successfully sending the item at `index`.
    ///
    /// Grows step-wise: `min(base * growth^floor(index / step), max)`.
    #[must_use]
    pub fn delay_after(&self, index: usize) -> Duration {
        let exponent = i32::try_from(index / self.step.max(1)).unwrap_or(i32::MAX);
        let factor = self.growth.powi(exponent);
        let delay = self.base_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Penalty after `consecutive_failures` failed sends in a row.
    #[must_use]
    pub fn failure_delay(&self, consecutive_failures: u32) -> Duration {
        self.base_retry_delay.saturating_mul(consecutive_failures)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        let window = Duration::from_millis(60_000);
        Self {
            window,
            min_replay_interval: window * 2,
        }
    }
}

impl Default for LikeBatchConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            delay: Duration::from_millis(3_000),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Creates a configuration with default tunables.
    ///
    /// The client id is derived from the machine id so the relay sees the
    /// same client across restarts.
    #[must_use]
    pub fn new(relay_url: Url, dj_name: impl Into<String>) -> Self {
        let client_id = match machine_uid::get() {
            Ok(machine_id) => {
                let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"pika.live");
                Uuid::new_v5(&namespace, machine_id.as_bytes())
            }
            Err(e) => {
                warn!("could not get machine id, using random client id: {e}");
                Uuid::new_v4()
            }
        };
        trace!("client uuid: {client_id}");

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        let user_agent = format!(
            "{}/{} (Rust; {os_name}/{os_version})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
        trace!("user agent: {user_agent}");

        Self {
            user_agent,
            client_id,
            dj_name: dj_name.into(),
            relay_url,
            reliability: ReliabilityConfig::default(),
            flush: FlushConfig::default(),
            dedup: DedupConfig::default(),
            likes: LikeBatchConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// The host name, for use as default performer name.
    #[must_use]
    pub fn default_dj_name() -> String {
        sysinfo::System::host_name().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_clamp_to_last() {
        let config = ReliabilityConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_millis(1_000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(4_000));
        assert_eq!(config.retry_delay(9), Duration::from_millis(4_000));
    }

    #[test]
    fn flush_delay_steps_every_five_messages() {
        let config = FlushConfig::default();
        assert_eq!(config.delay_after(0), Duration::from_millis(100));
        assert_eq!(config.delay_after(4), Duration::from_millis(100));

        let stepped = config.delay_after(5).as_secs_f64();
        assert!((stepped - 0.12).abs() < 1e-9);
        assert_eq!(config.delay_after(9), config.delay_after(5));
    }

    #[test]
    fn flush_delay_is_capped() {
        let config = FlushConfig::default();
        assert_eq!(config.delay_after(1_000), Duration::from_millis(2_000));
        assert_eq!(config.delay_after(usize::MAX), Duration::from_millis(2_000));
    }

    #[test]
    fn failure_delay_scales_linearly() {
        let config = FlushConfig::default();
        assert_eq!(config.failure_delay(2), Duration::from_secs(2));
    }

    #[test]
    fn replay_interval_defaults_to_two_windows() {
        let config = DedupConfig::default();
        assert_eq!(config.min_replay_interval, Duration::from_secs(120));
    }
}
