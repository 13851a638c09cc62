//! Seeding safety
//!
//! Copying the local store into the cloud is only safe the first time a
//! generation of the cloud store is created, when there is something to
//! copy, and when no other device already owns the dataset. Two devices
//! seeding at once would otherwise publish divergent histories into the
//! same container.

use std::fmt;

use serde::Serialize;

use crate::models::StoreIdentity;

/// What the checker looks at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedingInputs {
    /// A cloud container is mounted at all
    pub cloud_available: bool,
    /// A cloud store file already exists for the candidate identity
    pub cloud_store_exists: bool,
    /// Records in the local store; `None` when there is no local store file
    pub local_record_count: Option<u64>,
    /// Identity currently in the register
    pub registered_identity: Option<StoreIdentity>,
    /// Identity this device last wrote to the register
    pub last_written_identity: Option<StoreIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedingReason {
    /// Nothing stands in the way of seeding
    Safe,
    /// No cloud container to seed into
    CloudUnavailable,
    /// The register names a generation this device did not write
    ClaimedByOtherDevice,
    /// The cloud store for the candidate identity already holds data
    CloudStoreExists,
    LocalStoreMissing,
    LocalStoreEmpty,
}

impl fmt::Display for SeedingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SeedingReason::Safe => "safe to seed",
            SeedingReason::CloudUnavailable => "no cloud container available",
            SeedingReason::ClaimedByOtherDevice => "cloud store claimed by another device",
            SeedingReason::CloudStoreExists => "cloud store already exists",
            SeedingReason::LocalStoreMissing => "no local store",
            SeedingReason::LocalStoreEmpty => "local store is empty",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeedingDecision {
    pub reason: SeedingReason,
}

impl SeedingDecision {
    pub fn is_safe(&self) -> bool {
        self.reason == SeedingReason::Safe
    }
}

pub struct SeedingSafetyChecker;

impl SeedingSafetyChecker {
    /// Decide whether seeding may run
    ///
    /// Reasons are checked in a fixed order and the first that applies wins.
    pub fn evaluate(inputs: &SeedingInputs) -> SeedingDecision {
        let claimed = match inputs.registered_identity {
            Some(registered) => inputs.last_written_identity != Some(registered),
            None => false,
        };

        let reason = if !inputs.cloud_available {
            SeedingReason::CloudUnavailable
        } else if claimed {
            SeedingReason::ClaimedByOtherDevice
        } else if inputs.cloud_store_exists {
            SeedingReason::CloudStoreExists
        } else {
            match inputs.local_record_count {
                None => SeedingReason::LocalStoreMissing,
                Some(0) => SeedingReason::LocalStoreEmpty,
                Some(_) => SeedingReason::Safe,
            }
        };

        SeedingDecision { reason }
    }
}
