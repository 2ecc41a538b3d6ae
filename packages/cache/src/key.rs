//! Cache keys and artifact kinds.

use sha2::{Digest, Sha256};
use sirtep_provision_models::ProvisionRequest;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Kind of cached artifact. Each kind lives in its own directory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    /// Binary accessibility matrix.
    Matrix,
    /// Per-period provision table.
    Provision,
    /// Schedule summary returned to callers.
    Response,
}

/// Request parameters that identify a cached computation.
///
/// Two keys with any differing field always produce different
/// fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Project scenario id.
    pub scenario_id: i64,
    /// Project profile id.
    pub profile_id: i64,
    /// Number of schedule periods.
    pub periods: u32,
    /// Area budget per period.
    pub max_area_per_period: u64,
}

impl CacheKey {
    /// SHA-256 (hex) over a fixed-width encoding of the fields.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"sirtep/v1");
        hasher.update(self.scenario_id.to_be_bytes());
        hasher.update(self.profile_id.to_be_bytes());
        hasher.update(self.periods.to_be_bytes());
        hasher.update(self.max_area_per_period.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

impl From<&ProvisionRequest> for CacheKey {
    fn from(request: &ProvisionRequest) -> Self {
        Self {
            scenario_id: request.scenario_id,
            profile_id: request.profile_id,
            periods: request.periods,
            max_area_per_period: request.max_area_per_period,
        }
    }
}

impl From<ProvisionRequest> for CacheKey {
    fn from(request: ProvisionRequest) -> Self {
        Self::from(&request)
    }
}
