//! QoS controller configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QosError, QosResult};
use crate::request::VolumeId;
use crate::volume_queue::QosParams;

/// Dispatch algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchAlgorithm {
    /// Rate-reservation ring plus credit and priority round robin.
    WeightedFair,
    /// Nested assured/ceiling token buckets plus a shared pool.
    HierarchicalTokenBucket,
}

impl std::fmt::Display for DispatchAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchAlgorithm::WeightedFair => write!(f, "WeightedFair"),
            DispatchAlgorithm::HierarchicalTokenBucket => write!(f, "HierarchicalTokenBucket"),
        }
    }
}

/// A volume to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume identifier.
    pub volume_id: u64,
    /// Minimum guaranteed IOPS.
    pub assured_iops: u64,
    /// Maximum IOPS (0 = unbounded).
    #[serde(default)]
    pub throttle_iops: u64,
    /// Relative priority, 1 (highest) to 10 (lowest).
    pub priority: u8,
    /// Queue capacity; the controller default when absent.
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl VolumeConfig {
    /// Returns the volume id.
    pub fn id(&self) -> VolumeId {
        VolumeId(self.volume_id)
    }

    /// Returns the QoS policy.
    pub fn params(&self) -> QosParams {
        QosParams::new(self.assured_iops, self.throttle_iops, self.priority)
    }
}

/// Configuration for the QoS controller and its dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Dispatch algorithm.
    pub algorithm: DispatchAlgorithm,
    /// Aggregate IOPS budget of this node.
    pub total_rate: u64,
    /// Maximum dispatched-but-not-done requests (0 = unbounded).
    pub max_outstanding_ios: usize,
    /// Execute requests in the caller's context with no QoS at all.
    pub bypass_dispatcher: bool,
    /// Queue capacity used when a volume does not specify one.
    pub default_queue_capacity: usize,
    /// Burst cap of ceiling buckets and of the shared pool, in tokens.
    pub default_burst_size: u64,
    /// How long unused assured tokens are kept before they expire into the pool.
    pub assured_wait_time_ms: u64,
    /// Worker pool threads executing admitted requests.
    pub worker_threads: usize,
    /// Poll interval used when no token arrival time can be computed.
    pub idle_poll_us: u64,
    /// Longest park of the dispatch loop when no queue has work.
    pub idle_wait_ms: u64,
    /// WFQ rolling window for assured-slot throughput tracking.
    pub wfq_rate_window_ms: u64,
    /// WFQ: below this fraction of expected assured throughput the ring is scanned for work.
    pub wfq_behind_threshold: f64,
    /// WFQ: above this fraction of expected assured throughput assured slots are treated as open.
    pub wfq_ahead_threshold: f64,
    /// WFQ: credit cap is `assured / divisor + 1`.
    pub wfq_credit_divisor: u64,
    /// Volumes registered by the `cfs-qos` daemon at startup.
    pub volumes: Vec<VolumeConfig>,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            algorithm: DispatchAlgorithm::HierarchicalTokenBucket,
            total_rate: 10_000,
            max_outstanding_ios: 64,
            bypass_dispatcher: false,
            default_queue_capacity: 1024,
            default_burst_size: 10,
            assured_wait_time_ms: 1_000,
            worker_threads: 8,
            idle_poll_us: 100,
            idle_wait_ms: 50,
            wfq_rate_window_ms: 1_000,
            wfq_behind_threshold: 0.9,
            wfq_ahead_threshold: 1.2,
            wfq_credit_divisor: 2,
            volumes: Vec::new(),
        }
    }
}

impl QosConfig {
    /// Default configuration for the given algorithm and aggregate rate.
    pub fn new(algorithm: DispatchAlgorithm, total_rate: u64) -> Self {
        Self {
            algorithm,
            total_rate,
            ..Self::default()
        }
    }

    /// Loads a `.toml` or `.json` configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: QosConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks numeric sanity.
    pub fn validate(&self) -> QosResult<()> {
        if self.total_rate == 0 {
            return Err(QosError::InvalidConfig {
                reason: "total_rate must be non-zero".to_string(),
            });
        }
        if self.default_queue_capacity == 0 {
            return Err(QosError::InvalidConfig {
                reason: "default_queue_capacity must be non-zero".to_string(),
            });
        }
        if self.worker_threads == 0 {
            return Err(QosError::InvalidConfig {
                reason: "worker_threads must be non-zero".to_string(),
            });
        }
        if self.wfq_rate_window_ms == 0 || self.wfq_credit_divisor == 0 {
            return Err(QosError::InvalidConfig {
                reason: "wfq_rate_window_ms and wfq_credit_divisor must be non-zero".to_string(),
            });
        }
        if !(self.wfq_behind_threshold > 0.0 && self.wfq_behind_threshold <= 1.0) {
            return Err(QosError::InvalidConfig {
                reason: format!(
                    "wfq_behind_threshold {} outside (0, 1]",
                    self.wfq_behind_threshold
                ),
            });
        }
        if self.wfq_ahead_threshold < 1.0 {
            return Err(QosError::InvalidConfig {
                reason: format!("wfq_ahead_threshold {} below 1.0", self.wfq_ahead_threshold),
            });
        }
        let assured: u64 = self.volumes.iter().map(|v| v.assured_iops).sum();
        if assured > self.total_rate {
            return Err(QosError::InvalidConfig {
                reason: format!(
                    "configured volumes assure {} IOPS, above total_rate {}",
                    assured, self.total_rate
                ),
            });
        }
        for volume in &self.volumes {
            volume.params().validate()?;
        }
        Ok(())
    }

    /// Assured token wait time as a duration.
    pub fn assured_wait_time(&self) -> Duration {
        Duration::from_millis(self.assured_wait_time_ms)
    }

    /// Fallback poll interval.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_micros(self.idle_poll_us.max(1))
    }

    /// Longest idle park.
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = QosConfig::default();
        assert_eq!(config.algorithm, DispatchAlgorithm::HierarchicalTokenBucket);
        assert_eq!(config.total_rate, 10_000);
        assert_eq!(config.idle_poll_us, 100);
        assert_eq!(config.wfq_behind_threshold, 0.9);
        assert_eq!(config.wfq_ahead_threshold, 1.2);
        assert!(!config.bypass_dispatcher);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let config = QosConfig::new(DispatchAlgorithm::WeightedFair, 0);
        assert!(matches!(
            config.validate(),
            Err(QosError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_oversubscribed_volumes() {
        let mut config = QosConfig::new(DispatchAlgorithm::WeightedFair, 100);
        config.volumes.push(VolumeConfig {
            volume_id: 1,
            assured_iops: 80,
            throttle_iops: 0,
            priority: 1,
            capacity: None,
        });
        config.volumes.push(VolumeConfig {
            volume_id: 2,
            assured_iops: 40,
            throttle_iops: 0,
            priority: 1,
            capacity: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
algorithm = "weighted_fair"
total_rate = 1000
max_outstanding_ios = 16

[[volumes]]
volume_id = 1
assured_iops = 100
throttle_iops = 500
priority = 1

[[volumes]]
volume_id = 2
assured_iops = 100
priority = 5
capacity = 32
"#
        )
        .unwrap();

        let config = QosConfig::from_file(file.path()).unwrap();
        assert_eq!(config.algorithm, DispatchAlgorithm::WeightedFair);
        assert_eq!(config.total_rate, 1000);
        assert_eq!(config.max_outstanding_ios, 16);
        assert_eq!(config.default_queue_capacity, 1024);
        assert_eq!(config.volumes.len(), 2);
        assert_eq!(config.volumes[0].params(), QosParams::new(100, 500, 1));
        assert_eq!(config.volumes[1].throttle_iops, 0);
        assert_eq!(config.volumes[1].capacity, Some(32));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"algorithm": "hierarchical_token_bucket", "total_rate": 500, "bypass_dispatcher": true}}"#
        )
        .unwrap();

        let config = QosConfig::from_file(file.path()).unwrap();
        assert_eq!(config.algorithm, DispatchAlgorithm::HierarchicalTokenBucket);
        assert_eq!(config.total_rate, 500);
        assert!(config.bypass_dispatcher);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(QosConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_durations() {
        let config = QosConfig::default();
        assert_eq!(config.assured_wait_time(), Duration::from_secs(1));
        assert_eq!(config.idle_poll(), Duration::from_micros(100));
    }
}
