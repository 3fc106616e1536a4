//! Spansh galaxy dump adapter.
//!
//! Dumps are a top-level JSON array with one system object per line, usually gzipped
//! (`galaxy_1day.json.gz`, `galaxy_populated.json.gz`, ...). The file is streamed line by
//! line on a blocking thread, so memory stays flat regardless of dump size.

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use huginn_core::models::{FreshnessSource, SystemId};
use huginn_core::sources::{
    BulkPatch, DeltaPatch, FetchFailure, FetchInput, FetchOutcome, FetchReport, SourceAdapter,
};
use huginn_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

const CANCEL_CHECK_EVERY: usize = 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    id64: u64,
    name: String,
    #[serde(default)]
    bodies: Vec<BodyRecord>,
    #[serde(default)]
    stations: Vec<Value>,
    #[serde(default)]
    body_count: Option<u32>,
    #[serde(default)]
    population: Option<u64>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct BodyRecord {
    #[serde(default)]
    rings: Vec<Value>,
    #[serde(default)]
    stations: Vec<Value>,
}

/// One line of a dump.
#[derive(Debug, PartialEq)]
pub enum ParsedLine {
    /// Array brackets and blank lines.
    Structural,
    System(SystemId, BulkPatch),
    /// Parsed far enough to know which system it is about.
    BadSystem(SystemId, String),
    /// Not attributable to any system.
    Garbage(String),
}

pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim().trim_end_matches(',');
    if line.is_empty() || line == "[" || line == "]" {
        return ParsedLine::Structural;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return ParsedLine::Garbage(e.to_string()),
    };
    let Some(id) = value.get("id64").and_then(Value::as_u64).map(SystemId) else {
        return ParsedLine::Garbage("record has no id64".to_string());
    };
    match serde_json::from_value::<Record>(value) {
        Ok(record) => ParsedLine::System(id, to_patch(record)),
        Err(e) => ParsedLine::BadSystem(id, e.to_string()),
    }
}

fn to_patch(record: Record) -> BulkPatch {
    let has_ring = record.bodies.iter().any(|b| !b.rings.is_empty());
    let station_count =
        record.stations.len() + record.bodies.iter().map(|b| b.stations.len()).sum::<usize>();
    let body_count = record
        .body_count
        .or_else(|| (!record.bodies.is_empty()).then_some(record.bodies.len() as u32));
    // Keep scalars only; nested arrays (factions, markets) are large and unused.
    let passthrough = record
        .rest
        .into_iter()
        .filter(|(_, v)| !v.is_array() && !v.is_object())
        .collect();
    BulkPatch {
        name: Some(record.name),
        has_ring,
        station_count: Some(station_count as u32),
        body_count,
        population: record.population,
        passthrough,
    }
}

/// Stream `reader`, keeping only ids in `only` when given.
pub fn read_snapshot<R: BufRead>(
    reader: R,
    only: Option<&HashSet<SystemId>>,
    cancel: &CancellationToken,
) -> Result<FetchReport> {
    let mut report = FetchReport::new(FreshnessSource::Bulk);
    let wanted = |id: &SystemId| only.is_none_or(|o| o.contains(id));
    for (n, line) in reader.lines().enumerate() {
        if n % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let line = line.map_err(|e| Error::backend("read snapshot", e))?;
        match parse_line(&line) {
            ParsedLine::Structural => {}
            ParsedLine::System(id, patch) if wanted(&id) => {
                report.outcomes.push(FetchOutcome::ok(id, DeltaPatch::Bulk(patch)));
            }
            ParsedLine::BadSystem(id, message) if wanted(&id) => {
                tracing::debug!(system_id = %id, line = n + 1, error = %message, "malformed snapshot record");
                report
                    .outcomes
                    .push(FetchOutcome::failed(id, FetchFailure::Malformed { message }));
            }
            ParsedLine::System(..) | ParsedLine::BadSystem(..) => {}
            ParsedLine::Garbage(message) => {
                tracing::debug!(line = n + 1, error = %message, "unattributable snapshot line");
                report.malformed_records += 1;
            }
        }
    }
    Ok(report)
}

fn open(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)
        .map_err(|e| Error::backend(format!("open snapshot {}", path.display()), e))?;
    let gz = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gz"));
    let reader: Box<dyn BufRead + Send> = if gz {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(reader)
}

fn is_dump_name(name: &str) -> bool {
    name.starts_with("galaxy") && (name.ends_with(".json") || name.ends_with(".json.gz"))
}

/// Bulk adapter over a dump file, or a directory holding dumps.
#[derive(Debug, Clone)]
pub struct SpanshSnapshot {
    location: PathBuf,
}

impl SpanshSnapshot {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
        }
    }

    /// The dump to read: the location itself, or the most recently modified
    /// `galaxy*.json[.gz]` inside it.
    #[tracing::instrument(level = "debug", skip(self), fields(location = %self.location.display()))]
    pub fn resolve(&self) -> Result<PathBuf> {
        if self.location.is_file() {
            return Ok(self.location.clone());
        }
        let entries = std::fs::read_dir(&self.location).map_err(|e| {
            Error::backend(format!("list {}", self.location.display()), e)
        })?;
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_dump_name(name) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
        newest.map(|(_, p)| p).ok_or_else(|| {
            Error::NotFound(format!(
                "no galaxy*.json[.gz] in {} (download one from https://spansh.co.uk/dumps)",
                self.location.display()
            ))
        })
    }
}

#[async_trait]
impl SourceAdapter for SpanshSnapshot {
    fn kind(&self) -> FreshnessSource {
        FreshnessSource::Bulk
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn fetch(&self, input: FetchInput<'_>, cancel: &CancellationToken) -> Result<FetchReport> {
        let FetchInput::Snapshot { only } = input else {
            return Err(Error::InvalidInput(
                "spansh snapshot only supports snapshot input".to_string(),
            ));
        };
        let path = self.resolve()?;
        tracing::info!(path = %path.display(), "reading galaxy dump");
        let only = only.cloned();
        let cancel = cancel.clone();
        let report = tokio::task::spawn_blocking(move || {
            let reader = open(&path)?;
            read_snapshot(reader, only.as_ref(), &cancel)
        })
        .await
        .map_err(|e| Error::backend("snapshot reader task", e))??;
        tracing::info!(
            fetched = report.fetched(),
            malformed = report.failed_malformed(),
            "galaxy dump read"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"[
{"id64": 1, "name": "Alpha", "coords": {"x": 1.0, "y": 2.0, "z": 3.0}, "population": 1200, "allegiance": "Empire", "bodies": [{"name": "Alpha 1", "rings": [{"name": "A Ring"}]}, {"name": "Alpha 2", "stations": [{"name": "Outpost"}]}], "stations": [{"name": "Port"}]},
{"id64": 2, "name": "Beta", "bodyCount": 9, "bodies": [{"name": "Beta 1"}]},
{"id64": 3, "bodies": []},
{not json at all
]"#;

    #[test]
    fn ringed_bodies_and_stations_are_counted() {
        let line = DUMP.lines().nth(1).unwrap();
        let ParsedLine::System(id, patch) = parse_line(line) else {
            panic!("expected a system");
        };
        assert_eq!(id, SystemId(1));
        assert!(patch.has_ring);
        assert_eq!(patch.station_count, Some(2));
        assert_eq!(patch.body_count, Some(2));
        assert_eq!(patch.population, Some(1200));
        assert_eq!(patch.passthrough.get("allegiance"), Some(&Value::from("Empire")));
        assert!(!patch.passthrough.contains_key("coords"));
    }

    #[test]
    fn report_counts_bad_records_without_stopping() {
        let report =
            read_snapshot(DUMP.as_bytes(), None, &CancellationToken::new()).unwrap();
        assert_eq!(report.fetched(), 2);
        // id 3 lacks a name; the last line has no id at all.
        assert_eq!(report.failed_malformed(), 2);
        assert_eq!(report.malformed_records, 1);
        let beta = report
            .deltas()
            .find(|d| d.system_id == SystemId(2))
            .unwrap();
        let DeltaPatch::Bulk(beta) = beta.patch else {
            panic!("expected bulk patch");
        };
        assert!(!beta.has_ring);
        assert_eq!(beta.body_count, Some(9));
    }

    #[test]
    fn only_filter_keeps_requested_ids() {
        let only = HashSet::from([SystemId(2), SystemId(3)]);
        let report =
            read_snapshot(DUMP.as_bytes(), Some(&only), &CancellationToken::new()).unwrap();
        let ids: Vec<SystemId> = report.outcomes.iter().map(|o| o.system_id).collect();
        assert_eq!(ids, vec![SystemId(2), SystemId(3)]);
        assert_eq!(report.fetched(), 1);
    }

    #[test]
    fn cancelled_read_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = read_snapshot(DUMP.as_bytes(), None, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }
}
