//! Memory reservation sizing
//!
//! Deployed artifacts load their training data into memory, so the memory
//! request scales linearly with the size of a fixed set of training files:
//!
//! ```text
//! mebibytes = (coefficient * training_bytes + base) * safety_factor
//! ```
//!
//! The constants are policy, not physics, and are carried in [`MemoryPolicy`].

use std::path::Path;

use tracing::debug;

use crate::Error;

/// Default bytes → MiB coefficient
pub const DEFAULT_COEFFICIENT: f64 = 0.00004;
/// Default fixed overhead in MiB
pub const DEFAULT_BASE_MIB: f64 = 77.4;
/// Default safety multiplier
pub const DEFAULT_SAFETY_FACTOR: f64 = 1.10;

/// Linear memory sizing policy
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryPolicy {
    /// MiB per byte of training data
    pub coefficient: f64,
    /// Fixed overhead in MiB
    pub base_mib: f64,
    /// Multiplier applied to the whole estimate
    pub safety_factor: f64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            coefficient: DEFAULT_COEFFICIENT,
            base_mib: DEFAULT_BASE_MIB,
            safety_factor: DEFAULT_SAFETY_FACTOR,
        }
    }
}

impl MemoryPolicy {
    /// Estimate the memory reservation for the given training-data volume.
    ///
    /// Total for every input; monotonically non-decreasing in `training_bytes`.
    pub fn estimate(&self, training_bytes: u64) -> MemoryEstimate {
        let mebibytes =
            (self.coefficient * training_bytes as f64 + self.base_mib) * self.safety_factor;
        MemoryEstimate { mebibytes }
    }

    /// The smallest estimate this policy can produce (zero training bytes)
    pub fn floor(&self) -> f64 {
        self.base_mib * self.safety_factor
    }
}

/// A memory reservation in mebibytes
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryEstimate {
    mebibytes: f64,
}

impl MemoryEstimate {
    /// Raw estimate in MiB
    pub fn mebibytes(&self) -> f64 {
        self.mebibytes
    }

    /// Whole mebibytes written into resource quantities.
    ///
    /// Truncates, so the same input always yields the same quantity.
    pub fn whole_mebibytes(&self) -> u64 {
        self.mebibytes as u64
    }

    /// Kubernetes quantity string, e.g. `"129Mi"`
    pub fn quantity(&self) -> String {
        format!("{}Mi", self.whole_mebibytes())
    }
}

/// Sum the sizes of the named training files under `root`.
///
/// Every file must exist; a missing one is a precondition failure for the
/// whole pipeline.
pub async fn training_data_size(root: &Path, files: &[String]) -> Result<u64, Error> {
    let mut total = 0u64;
    for file in files {
        let path = root.join(file);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            Error::precondition(format!(
                "training file {} unreadable: {}",
                path.display(),
                e
            ))
        })?;
        debug!(file = %path.display(), bytes = metadata.len(), "training file sized");
        total += metadata.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Story: Linear sizing policy
    // =========================================================================

    #[test]
    fn story_empty_training_data_reserves_the_floor() {
        let policy = MemoryPolicy::default();
        let estimate = policy.estimate(0);
        assert!((estimate.mebibytes() - 77.4 * 1.10).abs() < 1e-9);
        assert!((estimate.mebibytes() - policy.floor()).abs() < 1e-9);
        assert_eq!(estimate.quantity(), "85Mi");
    }

    #[test]
    fn story_one_megabyte_of_training_data() {
        let estimate = MemoryPolicy::default().estimate(1_000_000);
        assert!((estimate.mebibytes() - 129.14).abs() < 1e-6);
        assert_eq!(estimate.whole_mebibytes(), 129);
        assert_eq!(estimate.quantity(), "129Mi");
    }

    #[test]
    fn story_estimate_never_decreases_and_never_drops_below_floor() {
        let policy = MemoryPolicy::default();
        let mut previous = policy.estimate(0).mebibytes();
        for bytes in [1u64, 10, 999, 25_000, 1_000_000, 73_000_000, 4_000_000_000] {
            let current = policy.estimate(bytes).mebibytes();
            assert!(current >= previous, "estimate decreased at {} bytes", bytes);
            assert!(current >= policy.floor());
            previous = current;
        }
    }

    #[test]
    fn story_policy_constants_are_configurable() {
        let policy = MemoryPolicy {
            coefficient: 0.0,
            base_mib: 256.0,
            safety_factor: 2.0,
        };
        assert_eq!(policy.estimate(10_000_000).quantity(), "512Mi");
    }

    #[test]
    fn story_same_input_same_quantity() {
        let policy = MemoryPolicy::default();
        assert_eq!(
            policy.estimate(123_456).quantity(),
            policy.estimate(123_456).quantity()
        );
    }

    // =========================================================================
    // Story: Training files on disk
    // =========================================================================

    #[tokio::test]
    async fn story_training_bytes_sum_named_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("intent_train.csv"), vec![b'a'; 300]).unwrap();
        std::fs::write(dir.path().join("entity.csv"), vec![b'b'; 200]).unwrap();
        std::fs::write(dir.path().join("unrelated.bin"), vec![b'c'; 9_999]).unwrap();

        let files = vec!["intent_train.csv".to_string(), "entity.csv".to_string()];
        let total = training_data_size(dir.path(), &files).await.unwrap();
        assert_eq!(total, 500);
    }

    #[tokio::test]
    async fn story_missing_training_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("intent_train.csv"), b"x").unwrap();

        let files = vec!["intent_train.csv".to_string(), "entity.csv".to_string()];
        let err = training_data_size(dir.path(), &files).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.to_string().contains("entity.csv"));
    }
}
