//! Faction/control enrichment.
//!
//! `GET {base}/systems/{id64}` returns the controlling power, its state and the minor
//! factions present.

use crate::http::{build_client, decode, get_bytes, normalize_base};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use huginn_core::Result;
use huginn_core::models::{ControlState, FactionPresence, FreshnessSource, SystemId, SystemRef};
use huginn_core::sources::{ControlPatch, DeltaPatch, LookupError, SystemLookup};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemBody {
    id64: Option<u64>,
    #[serde(default)]
    power: Option<String>,
    #[serde(default)]
    power_state: Option<String>,
    #[serde(default)]
    factions: Option<Vec<FactionBody>>,
    #[serde(default)]
    factions_updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct FactionBody {
    name: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    states: Vec<String>,
}

impl From<FactionBody> for FactionPresence {
    fn from(f: FactionBody) -> Self {
        let mut states = f.states;
        if let Some(s) = f.state.filter(|s| !s.trim().is_empty() && !states.contains(s)) {
            states.insert(0, s);
        }
        FactionPresence {
            name: f.name,
            states,
        }
    }
}

/// Parse one control response for `expected`.
///
/// A blank or missing power clears both power and state.
pub fn parse_control(
    body: &[u8],
    expected: SystemId,
) -> std::result::Result<ControlPatch, LookupError> {
    let parsed: SystemBody = decode(body)?;
    if let Some(id) = parsed.id64.filter(|id| *id != expected.0) {
        return Err(LookupError::Malformed(format!(
            "asked for system {expected}, got {id}"
        )));
    }
    let power = parsed
        .power
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    let control_state = match &power {
        Some(_) => parsed
            .power_state
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ControlState::parse),
        None => None,
    };

    let mut passthrough = parsed.rest;
    passthrough.remove("name");
    Ok(ControlPatch {
        power,
        control_state,
        factions: parsed
            .factions
            .map(|f| f.into_iter().map(FactionPresence::from).collect()),
        factions_updated_at: parsed.factions_updated_at,
        passthrough,
    })
}

pub struct InaraControlLookup {
    client: Client,
    base_url: String,
}

impl InaraControlLookup {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: normalize_base(base_url)?,
        })
    }

    pub fn system_url(&self, id: SystemId) -> String {
        format!("{}/systems/{}", self.base_url, id)
    }
}

#[async_trait]
impl SystemLookup for InaraControlLookup {
    fn kind(&self) -> FreshnessSource {
        FreshnessSource::Control
    }

    #[tracing::instrument(level = "debug", skip(self, system), fields(system_id = %system.id))]
    async fn lookup(&self, system: &SystemRef) -> std::result::Result<DeltaPatch, LookupError> {
        let body = get_bytes(&self.client, &self.system_url(system.id), &[]).await?;
        parse_control(&body, system.id).map(DeltaPatch::Control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_power_state_and_factions() {
        let body = br#"{
            "id64": 10477373803,
            "name": "Sol",
            "power": "Jerome Archer",
            "powerState": "Stronghold",
            "factions": [
                {"name": "Mother Gaia", "state": "Boom"},
                {"name": "Sol Workers' Party", "states": ["War", "Expansion"]}
            ],
            "factionsUpdatedAt": "2026-09-30T18:00:00Z",
            "allegiance": "Federation"
        }"#;
        let patch = parse_control(body, SystemId(10477373803)).unwrap();
        assert_eq!(patch.power.as_deref(), Some("Jerome Archer"));
        assert_eq!(patch.control_state, Some(ControlState::Stronghold));
        let factions = patch.factions.unwrap();
        assert_eq!(factions[0].states, vec!["Boom".to_string()]);
        assert!(!factions[1].is_peaceful());
        assert_eq!(patch.passthrough.get("allegiance"), Some(&Value::from("Federation")));
        assert!(!patch.passthrough.contains_key("name"));
    }

    #[test]
    fn missing_power_clears_state() {
        let body = br#"{"id64": 5, "power": "  ", "powerState": "Exploited"}"#;
        let patch = parse_control(body, SystemId(5)).unwrap();
        assert_eq!(patch.power, None);
        assert_eq!(patch.control_state, None);
        assert_eq!(patch.factions, None);
    }

    #[test]
    fn wrong_system_or_garbage_is_malformed() {
        assert!(matches!(
            parse_control(br#"{"id64": 6}"#, SystemId(5)),
            Err(LookupError::Malformed(_))
        ));
        assert!(matches!(
            parse_control(b"<html>", SystemId(5)),
            Err(LookupError::Malformed(_))
        ));
    }

    #[test]
    fn system_url_uses_id64() {
        let lookup = InaraControlLookup::new("https://inara.example/api/", Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            lookup.system_url(SystemId(42)),
            "https://inara.example/api/systems/42"
        );
    }
}
