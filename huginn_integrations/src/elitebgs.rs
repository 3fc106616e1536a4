//! Background-simulation tick lookups.
//!
//! `GET {base}/ticks` answers with the latest tick, either as one object or a one-item list.

use crate::http::{build_client, decode, get_bytes, normalize_base};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use huginn_core::sources::{LookupError, TickSource};
use huginn_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct TickBody {
    time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TickResponse {
    One(TickBody),
    Many(Vec<TickBody>),
}

/// Latest tick in a ticks response. An empty list means no tick is known.
pub fn parse_tick(body: &[u8]) -> std::result::Result<Option<DateTime<Utc>>, LookupError> {
    Ok(match decode::<TickResponse>(body)? {
        TickResponse::One(t) => Some(t.time),
        TickResponse::Many(ticks) => ticks.into_iter().map(|t| t.time).max(),
    })
}

pub struct EliteBgsTicks {
    client: Client,
    base_url: String,
}

impl EliteBgsTicks {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: normalize_base(base_url)?,
        })
    }

    pub fn ticks_url(&self) -> String {
        format!("{}/ticks", self.base_url)
    }
}

#[async_trait]
impl TickSource for EliteBgsTicks {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn latest_tick(&self) -> Result<Option<DateTime<Utc>>> {
        let body = get_bytes(&self.client, &self.ticks_url(), &[])
            .await
            .map_err(|e| Error::backend("tick lookup", e))?;
        parse_tick(&body).map_err(|e| Error::backend("tick lookup", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_an_object_or_a_list() {
        let tick = Utc.with_ymd_and_hms(2026, 10, 13, 14, 7, 0).unwrap();
        assert_eq!(
            parse_tick(br#"{"_id": "abc", "time": "2026-10-13T14:07:00.000Z"}"#).unwrap(),
            Some(tick)
        );
        assert_eq!(
            parse_tick(br#"[{"time": "2026-10-13T14:07:00Z", "updatedAt": "2026-10-13T14:30:00Z"}]"#)
                .unwrap(),
            Some(tick)
        );
        assert_eq!(parse_tick(b"[]").unwrap(), None);
    }

    #[test]
    fn missing_time_is_malformed() {
        assert!(matches!(
            parse_tick(br#"{"updatedAt": "2026-10-13T14:30:00Z"}"#),
            Err(LookupError::Malformed(_))
        ));
    }

    #[test]
    fn base_url_must_be_http() {
        assert!(EliteBgsTicks::new("ftp://elitebgs.app", Duration::from_secs(10)).is_err());
        let ticks =
            EliteBgsTicks::new("https://elitebgs.app/api/ebgs/v5/", Duration::from_secs(10))
                .unwrap();
        assert_eq!(ticks.ticks_url(), "https://elitebgs.app/api/ebgs/v5/ticks");
    }
}
