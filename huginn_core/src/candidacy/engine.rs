//! Pure candidacy rule.

use crate::candidacy::models::{
    CandidacyConfig, CandidacyInput, CandidacyReason, CandidacyVerdict, ControlBasis,
    CriterionFailure,
};
use crate::models::System;

/// Evaluate every criterion for one system.
///
/// Reads only the system record, the pre-resolved nearest anchor and `config`; the same
/// input always yields the same verdict.
pub fn evaluate(input: &CandidacyInput<'_>, config: &CandidacyConfig) -> CandidacyVerdict {
    let system = input.system;
    let mut failures = Vec::new();

    let control = control_basis(input, config);
    if control == ControlBasis::Unmet {
        failures.push(CriterionFailure::NotExploitable {
            power: system.power.clone(),
            state: system.control_state.clone(),
        });
    }

    let dominant_tier = config.dominant_tier(&system.resource_sites);
    if !system.resource_sites.any() {
        failures.push(CriterionFailure::NoResourceSites);
    }

    if config.require_ring && !system.has_ring {
        failures.push(CriterionFailure::NoRing);
    }

    if config.excluded_systems.contains(&system.id) {
        failures.push(CriterionFailure::Excluded);
    }

    let peaceful_factions = system.data.peaceful_factions();
    if config.require_peaceful_faction && peaceful_factions == Some(0) {
        failures.push(CriterionFailure::NoPeacefulFaction);
    }

    CandidacyVerdict {
        is_candidate: failures.is_empty(),
        reason: CandidacyReason {
            control,
            dominant_tier,
            peaceful_factions,
            failures,
        },
    }
}

/// True when every criterion except proximity holds, i.e. an anchor lookup could
/// still change the verdict.
pub fn needs_anchor(system: &System, config: &CandidacyConfig) -> bool {
    if config.is_anchor(system) {
        return false;
    }
    let probe = CandidacyInput {
        system,
        nearest_anchor: None,
    };
    evaluate(&probe, config)
        .reason
        .failures
        .iter()
        .all(|f| matches!(f, CriterionFailure::NotExploitable { .. }))
}

fn control_basis(input: &CandidacyInput<'_>, config: &CandidacyConfig) -> ControlBasis {
    if config.is_anchor(input.system) {
        if let Some(state) = input.system.control_state.clone() {
            return ControlBasis::Direct { state };
        }
    }
    match input.nearest_anchor {
        Some(anchor)
            if anchor.system_id != input.system.id
                && anchor.distance_ly <= config.proximity_radius_ly =>
        {
            ControlBasis::Proximity {
                anchor: anchor.system_id,
                distance_ly: anchor.distance_ly,
            }
        }
        _ => ControlBasis::Unmet,
    }
}
