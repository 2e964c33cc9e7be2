//! Upgrade path resolution
//!
//! Computes the ordered list of versions a device must install, one family
//! at a time, to get from its running version to a target.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::ladder::{BeyondLadder, Ladder};
use crate::version::{Family, Version};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Target {target} is not an upgrade from {current} (already current or a downgrade)")]
    AlreadyCurrentOrDowngrade { current: Version, target: Version },
    #[error("Target {target} belongs to family {family}, which is not on the upgrade ladder")]
    UnknownTarget { target: Version, family: Family },
    #[error("Target {target} is older than {base}, the minimum installable build of {family}")]
    BelowCheckpointBase {
        target: Version,
        base: Version,
        family: Family,
    },
}

/// Ordered versions to install; strictly increasing and ending at the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UpgradePath(Vec<Version>);

impl UpgradePath {
    pub fn hops(&self) -> &[Version] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Version> {
        self.0.iter()
    }

    pub fn target(&self) -> Option<&Version> {
        self.0.last()
    }
}

impl<'a> IntoIterator for &'a UpgradePath {
    type Item = &'a Version;
    type IntoIter = std::slice::Iter<'a, Version>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for UpgradePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, version) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", version)?;
        }
        Ok(())
    }
}

/// Resolve the stepping sequence from `current` to `target`
///
/// Every checkpoint whose family lies strictly between the two is visited at
/// its base build. When the target family has a base override the device is
/// not yet on, that base is installed first. The target is always last.
pub fn resolve(current: &Version, target: &Version, ladder: &Ladder) -> Result<UpgradePath, PathError> {
    if target <= current {
        return Err(PathError::AlreadyCurrentOrDowngrade {
            current: *current,
            target: *target,
        });
    }

    let target_family = target.family();
    let current_family = current.family();

    let known = ladder.contains(target_family);
    let extrapolated = !known
        && ladder.beyond_last() == BeyondLadder::Extrapolate
        && target_family > ladder.last().family;
    if !known && !extrapolated {
        return Err(PathError::UnknownTarget {
            target: *target,
            family: target_family,
        });
    }

    let target_base = ladder.base_of(target_family);
    if *target < target_base {
        return Err(PathError::BelowCheckpointBase {
            target: *target,
            base: target_base,
            family: target_family,
        });
    }

    let mut hops: Vec<Version> = ladder
        .checkpoints()
        .iter()
        .filter(|c| c.family > current_family && c.family < target_family)
        .map(|c| c.base())
        .collect();

    let needs_override_base = ladder
        .checkpoint(target_family)
        .is_some_and(|c| c.has_base_override());
    if needs_override_base && *current < target_base && target_base < *target {
        hops.push(target_base);
    }

    hops.push(*target);

    debug!(
        current = %current,
        target = %target,
        hops = hops.len(),
        extrapolated,
        "Resolved upgrade path"
    );

    Ok(UpgradePath(hops))
}
