//! The checkpoint ladder
//!
//! PAN-OS refuses to install an image more than one release family ahead of
//! the running image, so every upgrade walks a fixed ladder of families. Some
//! checkpoints only publish a later minimum build (12.1 starts at 12.1.2), which
//! is recorded as a base override.
//!
//! The ladder is constant data: build it once at startup and share it by
//! reference.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

use crate::version::{Family, Version};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LadderError {
    #[error("Ladder has no checkpoints")]
    Empty,
    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
    #[error("Checkpoint {later} does not follow {earlier} (families must be strictly increasing)")]
    OutOfOrder { earlier: Family, later: Family },
    #[error("Base {base} does not belong to checkpoint {family}")]
    ForeignBase { family: Family, base: Version },
}

/// What to do with a target whose family is beyond the last checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeyondLadder {
    /// Refuse the target as unknown
    #[default]
    Reject,
    /// Treat the target family as one more checkpoint after the last one
    Extrapolate,
}

/// A family that every upgrade must pass through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub family: Family,
    base: Option<Version>,
}

impl Checkpoint {
    pub const fn new(family: Family) -> Self {
        Self { family, base: None }
    }

    pub const fn with_base(family: Family, base: Version) -> Self {
        Self {
            family,
            base: Some(base),
        }
    }

    /// Minimum installable build of this checkpoint
    pub fn base(&self) -> Version {
        self.base.unwrap_or_else(|| self.family.nominal_base())
    }

    /// True when the minimum build is later than the nominal `X.Y.0`
    pub fn has_base_override(&self) -> bool {
        self.base() != self.family.nominal_base()
    }
}

/// Checkpoint entry as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Release family, e.g. "12.1"
    pub family: String,
    /// Minimum installable build when it is not X.Y.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

/// Ladder section of the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LadderConfig {
    #[serde(default)]
    pub beyond_last: BeyondLadder,
    /// Replaces the built-in ladder when non-empty
    #[serde(default, rename = "checkpoint", skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<CheckpointConfig>,
}

/// Ordered checkpoint families plus the policy for targets past the end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ladder {
    checkpoints: Vec<Checkpoint>,
    beyond_last: BeyondLadder,
}

impl Ladder {
    pub fn new(checkpoints: Vec<Checkpoint>, beyond_last: BeyondLadder) -> Result<Self, LadderError> {
        if checkpoints.is_empty() {
            return Err(LadderError::Empty);
        }
        for pair in checkpoints.windows(2) {
            if pair[1].family <= pair[0].family {
                return Err(LadderError::OutOfOrder {
                    earlier: pair[0].family,
                    later: pair[1].family,
                });
            }
        }
        for checkpoint in &checkpoints {
            let base = checkpoint.base();
            if base.family() != checkpoint.family || base.is_hotfix() {
                return Err(LadderError::ForeignBase {
                    family: checkpoint.family,
                    base,
                });
            }
        }
        Ok(Self {
            checkpoints,
            beyond_last,
        })
    }

    /// The published PAN-OS upgrade ladder
    pub fn builtin() -> &'static Ladder {
        static BUILTIN: OnceLock<Ladder> = OnceLock::new();
        BUILTIN.get_or_init(|| Ladder {
            checkpoints: builtin_checkpoints(),
            beyond_last: BeyondLadder::Reject,
        })
    }

    /// Build a ladder from configuration, falling back to the built-in
    /// checkpoints when the configuration lists none
    pub fn from_config(config: &LadderConfig) -> Result<Self, LadderError> {
        if config.checkpoints.is_empty() {
            return Self::new(builtin_checkpoints(), config.beyond_last);
        }

        let checkpoints = config
            .checkpoints
            .iter()
            .map(|entry| {
                let family: Family = entry
                    .family
                    .parse()
                    .map_err(|e| LadderError::InvalidCheckpoint(format!("{}", e)))?;
                match &entry.base {
                    Some(base) => {
                        let base = Version::parse(base)
                            .map_err(|e| LadderError::InvalidCheckpoint(format!("{}", e)))?;
                        Ok(Checkpoint::with_base(family, base))
                    }
                    None => Ok(Checkpoint::new(family)),
                }
            })
            .collect::<Result<Vec<_>, LadderError>>()?;

        Self::new(checkpoints, config.beyond_last)
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn beyond_last(&self) -> BeyondLadder {
        self.beyond_last
    }

    pub fn contains(&self, family: Family) -> bool {
        self.checkpoint(family).is_some()
    }

    pub fn checkpoint(&self, family: Family) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.family == family)
    }

    pub fn last(&self) -> &Checkpoint {
        // Non-empty by construction
        &self.checkpoints[self.checkpoints.len() - 1]
    }

    /// Minimum installable build for a family
    ///
    /// Families outside the ladder fall back to `X.Y.0`.
    pub fn base_of(&self, family: Family) -> Version {
        self.checkpoint(family)
            .map(Checkpoint::base)
            .unwrap_or_else(|| family.nominal_base())
    }
}

fn builtin_checkpoints() -> Vec<Checkpoint> {
    vec![
        Checkpoint::new(Family::new(9, 0)),
        Checkpoint::new(Family::new(9, 1)),
        Checkpoint::new(Family::new(10, 0)),
        Checkpoint::new(Family::new(10, 1)),
        Checkpoint::new(Family::new(10, 2)),
        Checkpoint::new(Family::new(11, 0)),
        Checkpoint::new(Family::new(11, 1)),
        Checkpoint::new(Family::new(11, 2)),
        Checkpoint::with_base(Family::new(12, 1), Version::new(12, 1, 2)),
    ]
}
