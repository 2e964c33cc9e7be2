//! paprep Core - Version model, upgrade ladder, and path resolution
//!
//! This crate provides the foundational types for paprep:
//! - PAN-OS version parsing and ordering (including `-hN` hotfix builds)
//! - The checkpoint ladder every upgrade must step through
//! - Upgrade path resolution from a running version to a target
//! - Validation of operator-supplied setup input

pub mod ladder;
pub mod path;
pub mod setup;
pub mod version;

pub use ladder::{BeyondLadder, Checkpoint, CheckpointConfig, Ladder, LadderConfig, LadderError};
pub use path::{resolve, PathError, UpgradePath};
pub use setup::{validate_password, SetupInput, ValidatedSetup, ValidationError};
pub use version::{Family, FamilyError, Version, VersionError};
