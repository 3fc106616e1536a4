//! Resource-site enrichment.
//!
//! `GET {base}/bounty?system={name}` lists nearby systems with their RES tiers; only the
//! entry for the requested system is used.

use crate::http::{build_client, decode, get_bytes, normalize_base};
use async_trait::async_trait;
use huginn_core::Result;
use huginn_core::models::{FreshnessSource, ResourceSites, SystemRef};
use huginn_core::sources::{DeltaPatch, LookupError, ResourceSitesPatch, SystemLookup};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct BountyResponse {
    #[serde(default)]
    systems: Vec<BountyEntry>,
}

#[derive(Debug, Deserialize)]
struct BountyEntry {
    name: String,
    #[serde(default)]
    hazardous: bool,
    #[serde(default)]
    high: bool,
    #[serde(default)]
    medium: bool,
    #[serde(default)]
    low: bool,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// Pick `system_name` out of a bounty listing. Names compare case-insensitively.
pub fn parse_sites(
    body: &[u8],
    system_name: &str,
) -> std::result::Result<ResourceSitesPatch, LookupError> {
    let parsed: BountyResponse = decode(body)?;
    let wanted = system_name.trim();
    let entry = parsed
        .systems
        .into_iter()
        .find(|e| e.name.trim().eq_ignore_ascii_case(wanted))
        .ok_or_else(|| LookupError::Malformed(format!("'{wanted}' not in response")))?;
    Ok(ResourceSitesPatch {
        sites: ResourceSites {
            hazardous: entry.hazardous,
            high: entry.high,
            medium: entry.medium,
            low: entry.low,
        },
        passthrough: entry.rest,
    })
}

pub struct SiriuscorpLookup {
    client: Client,
    endpoint: String,
}

impl SiriuscorpLookup {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: format!("{}/bounty", normalize_base(base_url)?),
        })
    }
}

#[async_trait]
impl SystemLookup for SiriuscorpLookup {
    fn kind(&self) -> FreshnessSource {
        FreshnessSource::ResourceSites
    }

    #[tracing::instrument(level = "debug", skip(self, system), fields(system_id = %system.id))]
    async fn lookup(&self, system: &SystemRef) -> std::result::Result<DeltaPatch, LookupError> {
        let query = [("system", system.name.as_str())];
        let body = get_bytes(&self.client, &self.endpoint, &query).await?;
        parse_sites(&body, &system.name).map(DeltaPatch::ResourceSites)
    }
}
