//! SQLite-backed catalogue.
//!
//! Single WAL-mode file for local development, or a private in-memory database for
//! tests. Coordinates are plain columns; the proximity query prefilters with a
//! bounding box and ranks by squared distance.

use crate::candidacy::models::{Anchor, AnchorFilter, CandidacyVerdict};
use crate::catalogue::traits::{CatalogueStore, ListQuery, MergeOutcome, StaleScope, SystemFilter};
use crate::models::{
    ControlState, Coords, EnrichmentData, Freshness, FreshnessSource, ResourceSites, System,
    SystemId, SystemMetadata, SystemSeed,
};
use crate::sources::models::{DeltaPatch, SystemDelta};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Fixed-width UTC timestamps so TEXT comparison orders chronologically.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS systems (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  x REAL NOT NULL,
  y REAL NOT NULL,
  z REAL NOT NULL,
  power TEXT NULL,
  control_state TEXT NULL,
  has_ring INTEGER NOT NULL DEFAULT 0,
  res_hazardous INTEGER NOT NULL DEFAULT 0,
  res_high INTEGER NOT NULL DEFAULT 0,
  res_medium INTEGER NOT NULL DEFAULT 0,
  res_low INTEGER NOT NULL DEFAULT 0,
  is_candidate INTEGER NOT NULL DEFAULT 0,
  is_interested INTEGER NULL,
  bulk_updated_at TEXT NULL,
  control_updated_at TEXT NULL,
  resource_sites_updated_at TEXT NULL,
  candidacy_checked_at TEXT NULL,
  metadata TEXT NOT NULL DEFAULT '{}',
  data TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS systems_candidate_idx ON systems(is_candidate);
CREATE INDEX IF NOT EXISTS systems_interested_idx ON systems(is_interested);
CREATE INDEX IF NOT EXISTS systems_power_state_idx ON systems(power, control_state);
CREATE INDEX IF NOT EXISTS systems_xyz_idx ON systems(x, y, z);
CREATE INDEX IF NOT EXISTS systems_bulk_ts_idx ON systems(bulk_updated_at);
CREATE INDEX IF NOT EXISTS systems_control_ts_idx ON systems(control_updated_at);
CREATE INDEX IF NOT EXISTS systems_res_ts_idx ON systems(resource_sites_updated_at);
CREATE INDEX IF NOT EXISTS systems_candidacy_ts_idx ON systems(candidacy_checked_at);
"#;

const SELECT_COLUMNS: &str = "SELECT id, name, x, y, z, power, control_state, has_ring, \
     res_hazardous, res_high, res_medium, res_low, is_candidate, is_interested, \
     bulk_updated_at, control_updated_at, resource_sites_updated_at, candidacy_checked_at, \
     metadata, data FROM systems";

#[derive(Clone)]
pub struct SqliteCatalogue {
    pool: SqlitePool,
}

impl SqliteCatalogue {
    /// Open (or create) a catalogue file, creating parent directories as needed.
    #[tracing::instrument(level = "debug", skip(path))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::store("sqlite catalogue mkdir", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(db_err("sqlite catalogue connect options"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(db_err("sqlite catalogue connect"))?;
        Self::with_pool(pool).await
    }

    /// A private in-memory catalogue (single connection, so every query sees the same database).
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(db_err("sqlite catalogue connect options"))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(db_err("sqlite catalogue connect"))?;
        Self::with_pool(pool).await
    }

    /// Connect from a `sqlite://path` or `sqlite::memory:` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        let path = path.split('?').next().unwrap_or(path);
        if path.is_empty() {
            return Err(Error::Config(format!("sqlite url has no path: {url}")));
        }
        Self::open(path).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(db_err("sqlite catalogue schema"))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a freshly seeded system; existing ids are left alone.
    #[tracing::instrument(level = "debug", skip(self, seed), fields(system_id = %seed.id))]
    pub async fn insert_seed(&self, seed: &SystemSeed) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO systems (id, name, x, y, z)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(id) DO NOTHING
"#,
        )
        .bind(seed.id.as_i64())
        .bind(&seed.name)
        .bind(seed.coords.x)
        .bind(seed.coords.y)
        .bind(seed.coords.z)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert seed"))?;
        Ok(())
    }

    /// Operator intent flag; never touched by the refresh pipeline.
    pub async fn set_interested(&self, id: SystemId, interested: Option<bool>) -> Result<MergeOutcome> {
        let res = sqlx::query("UPDATE systems SET is_interested = ?1 WHERE id = ?2")
            .bind(interested)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(db_err("set interested"))?;
        Ok(outcome(res.rows_affected()))
    }

    fn system_from_row(row: &SqliteRow) -> Result<System> {
        let get_ts = |col: &str| -> Result<Option<DateTime<Utc>>> {
            let raw: Option<String> = row.try_get(col).map_err(db_err("read timestamp"))?;
            raw.map(|s| parse_ts(&s)).transpose()
        };
        let metadata: String = row.try_get("metadata").map_err(db_err("read metadata"))?;
        let data: String = row.try_get("data").map_err(db_err("read data"))?;
        let control_state: Option<String> =
            row.try_get("control_state").map_err(db_err("read control_state"))?;

        Ok(System {
            id: SystemId::from_i64(row.try_get("id").map_err(db_err("read id"))?),
            name: row.try_get("name").map_err(db_err("read name"))?,
            coords: Coords::new(
                row.try_get("x").map_err(db_err("read x"))?,
                row.try_get("y").map_err(db_err("read y"))?,
                row.try_get("z").map_err(db_err("read z"))?,
            ),
            power: row.try_get("power").map_err(db_err("read power"))?,
            control_state: control_state.map(|s| ControlState::parse(&s)),
            has_ring: row.try_get("has_ring").map_err(db_err("read has_ring"))?,
            resource_sites: ResourceSites {
                hazardous: row.try_get("res_hazardous").map_err(db_err("read res"))?,
                high: row.try_get("res_high").map_err(db_err("read res"))?,
                medium: row.try_get("res_medium").map_err(db_err("read res"))?,
                low: row.try_get("res_low").map_err(db_err("read res"))?,
            },
            is_candidate: row.try_get("is_candidate").map_err(db_err("read is_candidate"))?,
            is_interested: row
                .try_get("is_interested")
                .map_err(db_err("read is_interested"))?,
            freshness: Freshness {
                bulk_updated_at: get_ts("bulk_updated_at")?,
                control_updated_at: get_ts("control_updated_at")?,
                resource_sites_updated_at: get_ts("resource_sites_updated_at")?,
                candidacy_checked_at: get_ts("candidacy_checked_at")?,
            },
            metadata: serde_json::from_str::<SystemMetadata>(&metadata)
                .map_err(|e| Error::store("decode metadata", e))?,
            data: serde_json::from_str::<EnrichmentData>(&data)
                .map_err(|e| Error::store("decode data", e))?,
        })
    }
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::store(context, e)
}

fn fmt_ts(at: DateTime<Utc>) -> String {
    at.format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::store(format!("parse timestamp '{s}'"), e))
}

fn outcome(rows_affected: u64) -> MergeOutcome {
    if rows_affected == 0 {
        MergeOutcome::Unknown
    } else {
        MergeOutcome::Merged
    }
}

/// `col = json_set(COALESCE(col, '{}'), '$.k1', json(?), ...)`, replacing whole top-level keys.
fn push_json_set(qb: &mut QueryBuilder<'_, Sqlite>, col: &str, patch: &Map<String, Value>) {
    qb.push(format!("{col} = json_set(COALESCE({col}, '{{}}')"));
    for (k, v) in patch {
        qb.push(format!(", '$.{k}', json("));
        qb.push_bind(v.to_string());
        qb.push(")");
    }
    qb.push(")");
}

#[async_trait]
impl CatalogueStore for SqliteCatalogue {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("ping"))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, scope))]
    async fn stale_system_ids(
        &self,
        source: FreshnessSource,
        cutoff: DateTime<Utc>,
        scope: &StaleScope,
    ) -> Result<Vec<SystemId>> {
        let col = source.column();
        let sql = format!(
            "SELECT id FROM systems \
             WHERE ({col} IS NULL OR {col} <= ?1) AND (?2 = 0 OR has_ring = 1) \
             ORDER BY {col} IS NOT NULL, {col} ASC, id ASC LIMIT ?3"
        );
        let limit = scope.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(&sql)
            .bind(fmt_ts(cutoff))
            .bind(scope.ringed_only)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("stale system ids"))?;
        rows.iter()
            .map(|r| {
                r.try_get::<i64, _>("id")
                    .map(SystemId::from_i64)
                    .map_err(db_err("read id"))
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn candidacy_self_heal_ids(&self, limit: Option<usize>) -> Result<Vec<SystemId>> {
        let rows = sqlx::query(
            r#"
SELECT id FROM systems
WHERE COALESCE(bulk_updated_at, control_updated_at, resource_sites_updated_at) IS NOT NULL
  AND (candidacy_checked_at IS NULL
       OR candidacy_checked_at < MAX(COALESCE(bulk_updated_at, ''),
                                     COALESCE(control_updated_at, ''),
                                     COALESCE(resource_sites_updated_at, '')))
ORDER BY id ASC
LIMIT ?1
"#,
        )
        .bind(limit.map(|l| l as i64).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("candidacy self-heal ids"))?;
        rows.iter()
            .map(|r| {
                r.try_get::<i64, _>("id")
                    .map(SystemId::from_i64)
                    .map_err(db_err("read id"))
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()))]
    async fn load_systems(&self, ids: &[SystemId]) -> Result<Vec<System>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(500) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
            qb.push(" WHERE id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.as_i64());
            }
            qb.push(")");
            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(db_err("load systems"))?;
            for r in rows {
                out.push(Self::system_from_row(&r)?);
            }
        }
        out.sort_by_key(|s| s.id);
        out.dedup_by_key(|s| s.id);
        Ok(out)
    }

    #[tracing::instrument(level = "debug", skip(self, delta), fields(system_id = %delta.system_id, source = %delta.patch.source()))]
    async fn apply_delta(&self, delta: &SystemDelta, at: DateTime<Utc>) -> Result<MergeOutcome> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE systems SET ");
        match &delta.patch {
            DeltaPatch::Bulk(b) => {
                qb.push("name = COALESCE(");
                qb.push_bind(b.name.clone().filter(|n| !n.trim().is_empty()));
                qb.push(", name), has_ring = ");
                qb.push_bind(b.has_ring);
                qb.push(", ");
                push_json_set(&mut qb, "metadata", &delta.patch.metadata_patch());
            }
            DeltaPatch::Control(c) => {
                qb.push("power = ");
                qb.push_bind(c.power.clone());
                qb.push(", control_state = ");
                qb.push_bind(c.control_state.as_ref().map(|s| s.as_str().to_string()));
                qb.push(", ");
                push_json_set(&mut qb, "data", &delta.patch.data_patch()?);
            }
            DeltaPatch::ResourceSites(r) => {
                qb.push("res_hazardous = ");
                qb.push_bind(r.sites.hazardous);
                qb.push(", res_high = ");
                qb.push_bind(r.sites.high);
                qb.push(", res_medium = ");
                qb.push_bind(r.sites.medium);
                qb.push(", res_low = ");
                qb.push_bind(r.sites.low);
                qb.push(", ");
                push_json_set(&mut qb, "data", &delta.patch.data_patch()?);
            }
        }
        qb.push(format!(", {} = ", delta.patch.source().column()));
        qb.push_bind(fmt_ts(at));
        qb.push(" WHERE id = ");
        qb.push_bind(delta.system_id.as_i64());

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("apply delta"))?;
        Ok(outcome(res.rows_affected()))
    }

    #[tracing::instrument(level = "debug", skip(self, verdict), fields(system_id = %id))]
    async fn record_candidacy(
        &self,
        id: SystemId,
        verdict: &CandidacyVerdict,
        at: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE systems SET is_candidate = ");
        qb.push_bind(verdict.is_candidate);
        qb.push(", ");
        push_json_set(&mut qb, "metadata", &verdict.metadata_patch()?);
        qb.push(", candidacy_checked_at = ");
        qb.push_bind(fmt_ts(at));
        qb.push(" WHERE id = ");
        qb.push_bind(id.as_i64());

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("record candidacy"))?;
        Ok(outcome(res.rows_affected()))
    }

    #[tracing::instrument(level = "debug", skip(self, filter))]
    async fn nearest_anchor(
        &self,
        origin: Coords,
        radius_ly: f64,
        filter: &AnchorFilter,
        exclude: SystemId,
    ) -> Result<Option<Anchor>> {
        if filter.states.is_empty() {
            return Ok(None);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id, ((x - ");
        qb.push_bind(origin.x);
        qb.push(") * (x - ");
        qb.push_bind(origin.x);
        qb.push(") + (y - ");
        qb.push_bind(origin.y);
        qb.push(") * (y - ");
        qb.push_bind(origin.y);
        qb.push(") + (z - ");
        qb.push_bind(origin.z);
        qb.push(") * (z - ");
        qb.push_bind(origin.z);
        qb.push(")) AS d2 FROM systems WHERE x BETWEEN ");
        qb.push_bind(origin.x - radius_ly);
        qb.push(" AND ");
        qb.push_bind(origin.x + radius_ly);
        qb.push(" AND y BETWEEN ");
        qb.push_bind(origin.y - radius_ly);
        qb.push(" AND ");
        qb.push_bind(origin.y + radius_ly);
        qb.push(" AND z BETWEEN ");
        qb.push_bind(origin.z - radius_ly);
        qb.push(" AND ");
        qb.push_bind(origin.z + radius_ly);
        qb.push(" AND id <> ");
        qb.push_bind(exclude.as_i64());
        qb.push(" AND power = ");
        qb.push_bind(filter.power.clone());
        qb.push(" AND control_state IN (");
        let mut sep = qb.separated(", ");
        for state in filter.state_names() {
            sep.push_bind(state);
        }
        qb.push(") ORDER BY d2 ASC, id ASC LIMIT 1");

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("nearest anchor"))?;
        let Some(r) = row else {
            return Ok(None);
        };
        let d2: f64 = r.try_get("d2").map_err(db_err("read distance"))?;
        let distance_ly = d2.sqrt();
        if distance_ly > radius_ly {
            // Box corners lie outside the sphere.
            return Ok(None);
        }
        Ok(Some(Anchor {
            system_id: SystemId::from_i64(r.try_get("id").map_err(db_err("read id"))?),
            distance_ly,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_systems(&self, filter: &SystemFilter, query: ListQuery) -> Result<Vec<System>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id ASC LIMIT ");
        qb.push_bind(query.limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(query.offset as i64);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list systems"))?;
        rows.iter().map(Self::system_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn count_systems(&self, filter: &SystemFilter) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) AS n FROM systems");
        push_filter(&mut qb, filter);
        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("count systems"))?;
        let n: i64 = row.try_get("n").map_err(db_err("read count"))?;
        Ok(n.max(0) as u64)
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &SystemFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(c) = filter.candidate {
        qb.push(" AND is_candidate = ");
        qb.push_bind(c);
    }
    if let Some(i) = filter.interested {
        qb.push(" AND COALESCE(is_interested, 0) = ");
        qb.push_bind(i);
    }
    if let Some(p) = &filter.power {
        qb.push(" AND power = ");
        qb.push_bind(p.clone());
    }
}
