use crate::models::{ControlState, ResourceSites, ResourceTier, System, SystemId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Immutable rule parameters for one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidacyConfig {
    pub pledged_power: String,
    /// Control states under which the pledged power can be farmed for combat zones.
    pub exploitable_states: Vec<ControlState>,
    /// Jump range within which an exploitable system qualifies its neighbours.
    pub proximity_radius_ly: f64,
    /// Tier order used to pick the dominant resource site.
    pub tier_preference: Vec<ResourceTier>,
    pub require_ring: bool,
    pub excluded_systems: BTreeSet<SystemId>,
    /// When set, systems whose known factions are all at war or in elections are excluded.
    pub require_peaceful_faction: bool,
}

impl CandidacyConfig {
    pub const DEFAULT_RADIUS_LY: f64 = 50.0;

    pub fn default_exploitable_states() -> Vec<ControlState> {
        vec![
            ControlState::Expansion,
            ControlState::Exploited,
            ControlState::Fortified,
            ControlState::Stronghold,
            ControlState::Controlled,
        ]
    }

    #[tracing::instrument(level = "debug")]
    pub fn new(pledged_power: impl Into<String> + std::fmt::Debug) -> Result<Self> {
        let cfg = Self {
            pledged_power: pledged_power.into(),
            exploitable_states: Self::default_exploitable_states(),
            proximity_radius_ly: Self::DEFAULT_RADIUS_LY,
            tier_preference: ResourceTier::ALL.to_vec(),
            require_ring: true,
            excluded_systems: BTreeSet::new(),
            require_peaceful_faction: false,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pledged_power.trim().is_empty() {
            return Err(Error::Config("pledged power is not set".to_string()));
        }
        if !(self.proximity_radius_ly.is_finite() && self.proximity_radius_ly >= 0.0) {
            return Err(Error::Config(format!(
                "proximity radius must be a non-negative number, got {}",
                self.proximity_radius_ly
            )));
        }
        if self.tier_preference.is_empty() {
            return Err(Error::Config("tier preference is empty".to_string()));
        }
        Ok(())
    }

    /// First present tier in `tier_preference`; tiers the preference leaves out follow
    /// in the default hazardous > high > medium > low order.
    pub fn dominant_tier(&self, sites: &ResourceSites) -> Option<ResourceTier> {
        sites
            .dominant(&self.tier_preference)
            .or_else(|| sites.dominant(&ResourceTier::ALL))
    }

    pub fn is_exploitable(&self, state: &ControlState) -> bool {
        self.exploitable_states.contains(state)
    }

    /// True when the system itself is controlled by the pledged power in an exploitable state.
    pub fn is_anchor(&self, system: &System) -> bool {
        system.power.as_deref() == Some(self.pledged_power.as_str())
            && system
                .control_state
                .as_ref()
                .is_some_and(|s| self.is_exploitable(s))
    }

    pub fn anchor_filter(&self) -> AnchorFilter {
        AnchorFilter {
            power: self.pledged_power.clone(),
            states: self.exploitable_states.clone(),
        }
    }
}

/// Predicate for "a system the pledged power can exploit", evaluated by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorFilter {
    pub power: String,
    pub states: Vec<ControlState>,
}

impl AnchorFilter {
    pub fn matches(&self, system: &System) -> bool {
        system.power.as_deref() == Some(self.power.as_str())
            && system
                .control_state
                .as_ref()
                .is_some_and(|s| self.states.contains(s))
    }

    pub fn state_names(&self) -> Vec<String> {
        self.states.iter().map(|s| s.as_str().to_string()).collect()
    }
}

/// Nearest qualifying neighbour found by the proximity query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub system_id: SystemId,
    pub distance_ly: f64,
}

/// Everything `evaluate` reads.
#[derive(Debug, Clone, Copy)]
pub struct CandidacyInput<'a> {
    pub system: &'a System,
    pub nearest_anchor: Option<Anchor>,
}

/// How the control criterion was satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum ControlBasis {
    Direct { state: ControlState },
    Proximity { anchor: SystemId, distance_ly: f64 },
    Unmet,
}

/// A criterion that did not hold, in evaluation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "criterion", rename_all = "snake_case")]
pub enum CriterionFailure {
    NotExploitable {
        power: Option<String>,
        state: Option<ControlState>,
    },
    NoResourceSites,
    NoRing,
    Excluded,
    NoPeacefulFaction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidacyReason {
    pub control: ControlBasis,
    #[serde(default)]
    pub dominant_tier: Option<ResourceTier>,
    #[serde(default)]
    pub peaceful_factions: Option<u32>,
    #[serde(default)]
    pub failures: Vec<CriterionFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidacyVerdict {
    pub is_candidate: bool,
    pub reason: CandidacyReason,
}

impl CandidacyVerdict {
    /// Metadata keys owned by the candidacy engine.
    pub fn metadata_patch(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut patch = serde_json::Map::new();
        patch.insert(
            "dominant_tier".to_string(),
            serde_json::to_value(self.reason.dominant_tier)
                .map_err(|e| Error::backend("serialize dominant tier", e))?,
        );
        patch.insert(
            "candidacy".to_string(),
            serde_json::to_value(&self.reason)
                .map_err(|e| Error::backend("serialize candidacy reason", e))?,
        );
        Ok(patch)
    }
}
