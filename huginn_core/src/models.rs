use crate::candidacy::models::CandidacyReason;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Stable 64-bit star system identifier (Spansh `id64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemId(pub u64);

impl SystemId {
    /// Storage representation (SQL `BIGINT`/`INTEGER`).
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(v: i64) -> Self {
        Self(v as u64)
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Galactic coordinates in light-years.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coords {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coords {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Coords) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Powerplay control state of a system.
///
/// Upstream sources spell these inconsistently, so parsing is case-insensitive and
/// unrecognized values are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ControlState {
    Unoccupied,
    Expansion,
    Contested,
    Exploited,
    Fortified,
    Stronghold,
    Controlled,
    Other(String),
}

impl ControlState {
    pub fn as_str(&self) -> &str {
        match self {
            ControlState::Unoccupied => "Unoccupied",
            ControlState::Expansion => "Expansion",
            ControlState::Contested => "Contested",
            ControlState::Exploited => "Exploited",
            ControlState::Fortified => "Fortified",
            ControlState::Stronghold => "Stronghold",
            ControlState::Controlled => "Controlled",
            ControlState::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "unoccupied" | "none" => ControlState::Unoccupied,
            "expansion" => ControlState::Expansion,
            "contested" => ControlState::Contested,
            "exploited" => ControlState::Exploited,
            "fortified" => ControlState::Fortified,
            "stronghold" => ControlState::Stronghold,
            "controlled" | "control" => ControlState::Controlled,
            _ => ControlState::Other(s.trim().to_string()),
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ControlState {
    fn from(s: String) -> Self {
        ControlState::parse(&s)
    }
}

impl From<ControlState> for String {
    fn from(s: ControlState) -> Self {
        s.as_str().to_string()
    }
}

/// Resource extraction site intensity. Declaration order is the default preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTier {
    Hazardous,
    High,
    Medium,
    Low,
}

impl ResourceTier {
    pub const ALL: [ResourceTier; 4] = [
        ResourceTier::Hazardous,
        ResourceTier::High,
        ResourceTier::Medium,
        ResourceTier::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceTier::Hazardous => "hazardous",
            ResourceTier::High => "high",
            ResourceTier::Medium => "medium",
            ResourceTier::Low => "low",
        }
    }
}

impl fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hazardous" | "haz" => Ok(ResourceTier::Hazardous),
            "high" => Ok(ResourceTier::High),
            "medium" | "med" | "reg" | "regular" => Ok(ResourceTier::Medium),
            "low" => Ok(ResourceTier::Low),
            other => Err(Error::InvalidInput(format!(
                "unknown resource tier '{other}'"
            ))),
        }
    }
}

/// Presence flags for the four resource-site tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSites {
    pub hazardous: bool,
    pub high: bool,
    pub medium: bool,
    pub low: bool,
}

impl ResourceSites {
    pub fn has(&self, tier: ResourceTier) -> bool {
        match tier {
            ResourceTier::Hazardous => self.hazardous,
            ResourceTier::High => self.high,
            ResourceTier::Medium => self.medium,
            ResourceTier::Low => self.low,
        }
    }

    pub fn any(&self) -> bool {
        self.hazardous || self.high || self.medium || self.low
    }

    /// First tier in `preference` that is present.
    pub fn dominant(&self, preference: &[ResourceTier]) -> Option<ResourceTier> {
        preference.iter().copied().find(|t| self.has(*t))
    }
}

/// The data sources tracked by the freshness ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessSource {
    Bulk,
    Control,
    ResourceSites,
    Candidacy,
}

impl FreshnessSource {
    pub const FETCHED: [FreshnessSource; 3] = [
        FreshnessSource::Bulk,
        FreshnessSource::Control,
        FreshnessSource::ResourceSites,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessSource::Bulk => "bulk",
            FreshnessSource::Control => "control",
            FreshnessSource::ResourceSites => "resource_sites",
            FreshnessSource::Candidacy => "candidacy",
        }
    }

    /// Catalogue column holding this source's timestamp.
    pub fn column(&self) -> &'static str {
        match self {
            FreshnessSource::Bulk => "bulk_updated_at",
            FreshnessSource::Control => "control_updated_at",
            FreshnessSource::ResourceSites => "resource_sites_updated_at",
            FreshnessSource::Candidacy => "candidacy_checked_at",
        }
    }
}

impl fmt::Display for FreshnessSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source "last successfully refreshed" ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Freshness {
    pub bulk_updated_at: Option<DateTime<Utc>>,
    pub control_updated_at: Option<DateTime<Utc>>,
    pub resource_sites_updated_at: Option<DateTime<Utc>>,
    pub candidacy_checked_at: Option<DateTime<Utc>>,
}

impl Freshness {
    pub fn get(&self, source: FreshnessSource) -> Option<DateTime<Utc>> {
        match source {
            FreshnessSource::Bulk => self.bulk_updated_at,
            FreshnessSource::Control => self.control_updated_at,
            FreshnessSource::ResourceSites => self.resource_sites_updated_at,
            FreshnessSource::Candidacy => self.candidacy_checked_at,
        }
    }

    pub fn set(&mut self, source: FreshnessSource, at: DateTime<Utc>) {
        match source {
            FreshnessSource::Bulk => self.bulk_updated_at = Some(at),
            FreshnessSource::Control => self.control_updated_at = Some(at),
            FreshnessSource::ResourceSites => self.resource_sites_updated_at = Some(at),
            FreshnessSource::Candidacy => self.candidacy_checked_at = Some(at),
        }
    }

    /// Newest timestamp among the sources candidacy depends on.
    pub fn newest_dependency(&self) -> Option<DateTime<Utc>> {
        FreshnessSource::FETCHED
            .iter()
            .filter_map(|s| self.get(*s))
            .max()
    }

    /// True when some dependency moved after the last candidacy computation.
    pub fn candidacy_outdated(&self) -> bool {
        match (self.newest_dependency(), self.candidacy_checked_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(dep), Some(checked)) => checked < dep,
        }
    }
}

/// A minor faction present in a system, with its active states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionPresence {
    pub name: String,
    #[serde(default)]
    pub states: Vec<String>,
}

impl FactionPresence {
    const BLOCKING_STATES: [&'static str; 3] = ["war", "civil war", "elections"];

    /// A faction in War, Civil war or Elections does not hand out massacre missions.
    pub fn is_peaceful(&self) -> bool {
        !self.states.iter().any(|s| {
            let s = s.trim().to_ascii_lowercase();
            Self::BLOCKING_STATES.contains(&s.as_str())
        })
    }
}

/// Source-specific metadata with the keys the engine understands.
///
/// Anything else upstream sends is kept in `passthrough`, namespaced by source
/// (`"bulk": {...}`), and never interpreted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_tier: Option<ResourceTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidacy: Option<CandidacyReason>,
    #[serde(flatten)]
    pub passthrough: BTreeMap<String, serde_json::Value>,
}

/// Raw enrichment payloads with the keys the engine understands.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnrichmentData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factions: Option<Vec<FactionPresence>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factions_updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub passthrough: BTreeMap<String, serde_json::Value>,
}

impl EnrichmentData {
    /// Number of peaceful factions, when faction data is known at all.
    pub fn peaceful_factions(&self) -> Option<u32> {
        self.factions
            .as_ref()
            .map(|f| f.iter().filter(|f| f.is_peaceful()).count() as u32)
    }
}

/// Replace top-level keys of a serialized extension blob.
///
/// Every store merges blobs the same way: a key named in `patch` is overwritten,
/// all other keys are left untouched.
pub fn merge_top_level<T>(current: &T, patch: &serde_json::Map<String, serde_json::Value>) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let mut value = serde_json::to_value(current)
        .map_err(|e| Error::backend("serialize extension blob", e))?;
    let obj = match value.as_object_mut() {
        Some(obj) => obj,
        None => {
            return Err(Error::BackendMessage(
                "extension blob is not a JSON object".to_string(),
            ));
        }
    };
    for (k, v) in patch {
        obj.insert(k.clone(), v.clone());
    }
    serde_json::from_value(value).map_err(|e| Error::backend("deserialize extension blob", e))
}

/// One catalogue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub id: SystemId,
    pub name: String,
    pub coords: Coords,
    pub power: Option<String>,
    pub control_state: Option<ControlState>,
    pub has_ring: bool,
    pub resource_sites: ResourceSites,
    pub is_candidate: bool,
    /// Operator intent. Never written by the refresh pipeline.
    pub is_interested: Option<bool>,
    pub freshness: Freshness,
    #[serde(default)]
    pub metadata: SystemMetadata,
    #[serde(default)]
    pub data: EnrichmentData,
}

impl System {
    pub fn to_ref(&self) -> SystemRef {
        SystemRef {
            id: self.id,
            name: self.name.clone(),
            coords: self.coords,
        }
    }
}

/// What enrichment lookups need to address a system upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRef {
    pub id: SystemId,
    pub name: String,
    pub coords: Coords,
}

/// Initial record written by the seeding collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSeed {
    pub id: SystemId,
    pub name: String,
    pub coords: Coords,
}

impl SystemSeed {
    pub fn new(id: u64, name: impl Into<String>, coords: Coords) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("system name is empty".to_string()));
        }
        Ok(Self {
            id: SystemId(id),
            name,
            coords,
        })
    }

    /// A freshly seeded system: every mutable field at its default.
    pub fn into_system(self) -> System {
        System {
            id: self.id,
            name: self.name,
            coords: self.coords,
            power: None,
            control_state: None,
            has_ring: false,
            resource_sites: ResourceSites::default(),
            is_candidate: false,
            is_interested: None,
            freshness: Freshness::default(),
            metadata: SystemMetadata::default(),
            data: EnrichmentData::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn control_state_parses_case_insensitively() {
        assert_eq!(ControlState::parse("EXPLOITED"), ControlState::Exploited);
        assert_eq!(ControlState::parse(" fortified "), ControlState::Fortified);
        assert_eq!(
            ControlState::parse("Mystery"),
            ControlState::Other("Mystery".to_string())
        );
        let json = serde_json::to_string(&ControlState::Stronghold).unwrap();
        assert_eq!(json, "\"Stronghold\"");
    }

    #[test]
    fn dominant_tier_follows_preference_order() {
        let sites = ResourceSites {
            hazardous: false,
            high: true,
            medium: false,
            low: true,
        };
        assert_eq!(sites.dominant(&ResourceTier::ALL), Some(ResourceTier::High));
        assert_eq!(
            sites.dominant(&[ResourceTier::Low, ResourceTier::High]),
            Some(ResourceTier::Low)
        );
        assert_eq!(ResourceSites::default().dominant(&ResourceTier::ALL), None);
    }

    #[test]
    fn candidacy_outdated_compares_against_newest_dependency() {
        let t = |h| Utc.with_ymd_and_hms(2026, 1, 1, h, 0, 0).unwrap();
        let mut f = Freshness::default();
        assert!(!f.candidacy_outdated());

        f.control_updated_at = Some(t(2));
        assert!(f.candidacy_outdated());

        f.candidacy_checked_at = Some(t(2));
        assert!(!f.candidacy_outdated());

        f.resource_sites_updated_at = Some(t(3));
        assert!(f.candidacy_outdated());
    }

    #[test]
    fn peaceful_factions_ignore_blocking_states() {
        let data = EnrichmentData {
            factions: Some(vec![
                FactionPresence {
                    name: "A".into(),
                    states: vec!["Boom".into()],
                },
                FactionPresence {
                    name: "B".into(),
                    states: vec!["Civil War".into()],
                },
                FactionPresence {
                    name: "C".into(),
                    states: vec![],
                },
            ]),
            ..Default::default()
        };
        assert_eq!(data.peaceful_factions(), Some(2));
        assert_eq!(EnrichmentData::default().peaceful_factions(), None);
    }

    #[test]
    fn merge_top_level_replaces_only_named_keys() {
        let mut meta = SystemMetadata {
            station_count: Some(2),
            ..Default::default()
        };
        meta.passthrough
            .insert("bulk".into(), serde_json::json!({"allegiance": "Empire"}));

        let mut patch = serde_json::Map::new();
        patch.insert("dominant_tier".into(), serde_json::json!("high"));
        let merged = merge_top_level(&meta, &patch).unwrap();

        assert_eq!(merged.station_count, Some(2));
        assert_eq!(merged.dominant_tier, Some(ResourceTier::High));
        assert_eq!(
            merged.passthrough.get("bulk"),
            Some(&serde_json::json!({"allegiance": "Empire"}))
        );
    }
}
