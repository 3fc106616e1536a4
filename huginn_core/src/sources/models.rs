use crate::models::{
    ControlState, FactionPresence, FreshnessSource, ResourceSites, System, SystemId, SystemRef,
    merge_top_level,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

/// Fields the bulk snapshot owns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BulkPatch {
    pub name: Option<String>,
    pub has_ring: bool,
    pub station_count: Option<u32>,
    pub body_count: Option<u32>,
    pub population: Option<u64>,
    /// Unrecognized record fields, stored under `metadata.bulk`.
    #[serde(default)]
    pub passthrough: Map<String, Value>,
}

/// Fields the faction/control service owns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlPatch {
    pub power: Option<String>,
    pub control_state: Option<ControlState>,
    pub factions: Option<Vec<FactionPresence>>,
    pub factions_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub passthrough: Map<String, Value>,
}

/// Fields the resource-site service owns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSitesPatch {
    pub sites: ResourceSites,
    #[serde(default)]
    pub passthrough: Map<String, Value>,
}

/// A source-specific partial update for one system.
///
/// Each variant only names columns its source owns, so applying deltas from
/// different sources in any order converges to the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DeltaPatch {
    Bulk(BulkPatch),
    Control(ControlPatch),
    ResourceSites(ResourceSitesPatch),
}

impl DeltaPatch {
    pub fn source(&self) -> FreshnessSource {
        match self {
            DeltaPatch::Bulk(_) => FreshnessSource::Bulk,
            DeltaPatch::Control(_) => FreshnessSource::Control,
            DeltaPatch::ResourceSites(_) => FreshnessSource::ResourceSites,
        }
    }

    /// Top-level `metadata` keys this patch replaces.
    pub fn metadata_patch(&self) -> Map<String, Value> {
        let mut out = Map::new();
        if let DeltaPatch::Bulk(b) = self {
            out.insert("station_count".into(), opt_value(b.station_count));
            out.insert("body_count".into(), opt_value(b.body_count));
            out.insert("population".into(), opt_value(b.population));
            out.insert("bulk".into(), Value::Object(b.passthrough.clone()));
        }
        out
    }

    /// Top-level `data` keys this patch replaces.
    pub fn data_patch(&self) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        match self {
            DeltaPatch::Bulk(_) => {}
            DeltaPatch::Control(c) => {
                out.insert(
                    "factions".into(),
                    serde_json::to_value(&c.factions)
                        .map_err(|e| Error::backend("serialize factions", e))?,
                );
                out.insert(
                    "factions_updated_at".into(),
                    serde_json::to_value(c.factions_updated_at)
                        .map_err(|e| Error::backend("serialize factions_updated_at", e))?,
                );
                out.insert("control".into(), Value::Object(c.passthrough.clone()));
            }
            DeltaPatch::ResourceSites(r) => {
                out.insert("resource_sites".into(), Value::Object(r.passthrough.clone()));
            }
        }
        Ok(out)
    }

    /// Apply the patch to an in-memory record and stamp its source at `at`.
    ///
    /// Mirrors the column-scoped upsert the SQL stores perform.
    pub fn apply_to(&self, system: &mut System, at: DateTime<Utc>) -> Result<()> {
        match self {
            DeltaPatch::Bulk(b) => {
                if let Some(name) = b.name.as_ref().filter(|n| !n.trim().is_empty()) {
                    system.name = name.clone();
                }
                system.has_ring = b.has_ring;
                system.metadata = merge_top_level(&system.metadata, &self.metadata_patch())?;
            }
            DeltaPatch::Control(c) => {
                system.power = c.power.clone();
                system.control_state = c.control_state.clone();
                system.data = merge_top_level(&system.data, &self.data_patch()?)?;
            }
            DeltaPatch::ResourceSites(r) => {
                system.resource_sites = r.sites;
                system.data = merge_top_level(&system.data, &self.data_patch()?)?;
            }
        }
        system.freshness.set(self.source(), at);
        Ok(())
    }
}

fn opt_value<T: Into<Value>>(v: Option<T>) -> Value {
    v.map(Into::into).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDelta {
    pub system_id: SystemId,
    pub patch: DeltaPatch,
}

/// Why a system produced no delta this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchFailure {
    /// Network, timeout or rate-limit trouble that outlasted the retry budget.
    Transient { attempts: u32, message: String },
    Malformed { message: String },
}

impl FetchFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchFailure::Transient { .. })
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Transient { attempts, message } => {
                write!(f, "transient after {attempts} attempt(s): {message}")
            }
            FetchFailure::Malformed { message } => write!(f, "malformed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub system_id: SystemId,
    pub result: std::result::Result<DeltaPatch, FetchFailure>,
}

impl FetchOutcome {
    pub fn ok(system_id: SystemId, patch: DeltaPatch) -> Self {
        Self {
            system_id,
            result: Ok(patch),
        }
    }

    pub fn failed(system_id: SystemId, failure: FetchFailure) -> Self {
        Self {
            system_id,
            result: Err(failure),
        }
    }
}

/// Everything one adapter call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub source: FreshnessSource,
    pub outcomes: Vec<FetchOutcome>,
    /// Records that failed to parse before they could be attributed to a system.
    pub malformed_records: u64,
}

impl FetchReport {
    pub fn new(source: FreshnessSource) -> Self {
        Self {
            source,
            outcomes: Vec::new(),
            malformed_records: 0,
        }
    }

    pub fn deltas(&self) -> impl Iterator<Item = SystemDelta> + '_ {
        self.outcomes.iter().filter_map(|o| {
            o.result.as_ref().ok().map(|patch| SystemDelta {
                system_id: o.system_id,
                patch: patch.clone(),
            })
        })
    }

    pub fn fetched(&self) -> u64 {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count() as u64
    }

    pub fn failed_transient(&self) -> u64 {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Err(f) if f.is_transient()))
            .count() as u64
    }

    pub fn failed_malformed(&self) -> u64 {
        let attributed = self
            .outcomes
            .iter()
            .filter(|o| matches!(&o.result, Err(FetchFailure::Malformed { .. })))
            .count() as u64;
        attributed + self.malformed_records
    }

    pub fn extend(&mut self, other: FetchReport) {
        self.outcomes.extend(other.outcomes);
        self.malformed_records += other.malformed_records;
    }
}

/// What an adapter is asked to fetch.
#[derive(Debug, Clone, Copy)]
pub enum FetchInput<'a> {
    /// Stream the whole snapshot, keeping only the listed ids when given.
    Snapshot { only: Option<&'a HashSet<SystemId>> },
    Systems(&'a [SystemRef]),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Coords, SystemSeed};
    use chrono::TimeZone;

    fn system() -> System {
        SystemSeed::new(7, "Sol", Coords::new(0.0, 0.0, 0.0))
            .unwrap()
            .into_system()
    }

    #[test]
    fn sources_never_touch_each_others_keys() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let control = DeltaPatch::Control(ControlPatch {
            power: Some("Zemina Torval".into()),
            control_state: Some(ControlState::Fortified),
            factions: Some(vec![]),
            factions_updated_at: None,
            passthrough: Map::new(),
        });
        let mut res_extra = Map::new();
        res_extra.insert("reported_by".into(), Value::from("siriuscorp"));
        let res = DeltaPatch::ResourceSites(ResourceSitesPatch {
            sites: ResourceSites {
                low: true,
                ..Default::default()
            },
            passthrough: res_extra,
        });

        let mut a = system();
        control.apply_to(&mut a, at).unwrap();
        res.apply_to(&mut a, at).unwrap();

        let mut b = system();
        res.apply_to(&mut b, at).unwrap();
        control.apply_to(&mut b, at).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.power.as_deref(), Some("Zemina Torval"));
        assert!(a.resource_sites.low);
        assert_eq!(a.data.factions, Some(vec![]));
        assert!(a.data.passthrough.contains_key("resource_sites"));
        assert_eq!(a.freshness.control_updated_at, Some(at));
        assert_eq!(a.freshness.bulk_updated_at, None);
    }

    #[test]
    fn bulk_patch_keeps_name_when_absent() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut s = system();
        DeltaPatch::Bulk(BulkPatch {
            name: None,
            has_ring: true,
            station_count: Some(3),
            ..Default::default()
        })
        .apply_to(&mut s, at)
        .unwrap();
        assert_eq!(s.name, "Sol");
        assert!(s.has_ring);
        assert_eq!(s.metadata.station_count, Some(3));
        assert_eq!(s.metadata.body_count, None);
    }

    #[test]
    fn report_counts_split_by_failure_kind() {
        let mut report = FetchReport::new(FreshnessSource::Control);
        report.outcomes.push(FetchOutcome::ok(
            SystemId(1),
            DeltaPatch::Control(ControlPatch::default()),
        ));
        report.outcomes.push(FetchOutcome::failed(
            SystemId(2),
            FetchFailure::Transient {
                attempts: 3,
                message: "timeout".into(),
            },
        ));
        report.outcomes.push(FetchOutcome::failed(
            SystemId(3),
            FetchFailure::Malformed {
                message: "bad json".into(),
            },
        ));
        report.malformed_records = 2;

        assert_eq!(report.fetched(), 1);
        assert_eq!(report.failed_transient(), 1);
        assert_eq!(report.failed_malformed(), 3);
        assert_eq!(report.deltas().count(), 1);
    }
}
