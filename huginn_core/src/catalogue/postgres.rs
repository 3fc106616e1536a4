use crate::candidacy::models::{Anchor, AnchorFilter, CandidacyVerdict};
use crate::catalogue::traits::{CatalogueStore, ListQuery, MergeOutcome, StaleScope, SystemFilter};
use crate::models::{
    ControlState, Coords, EnrichmentData, Freshness, FreshnessSource, ResourceSites, System,
    SystemId, SystemMetadata,
};
use crate::sources::models::{DeltaPatch, SystemDelta};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Duration;

const MIGRATION_0001: &str = include_str!("../../migrations/0001_catalogue.sql");

const SELECT_COLUMNS: &str = "SELECT id, name, x, y, z, power, control_state, has_ring, \
     res_hazardous, res_high, res_medium, res_low, is_candidate, is_interested, \
     bulk_updated_at, control_updated_at, resource_sites_updated_at, candidacy_checked_at, \
     metadata, data FROM systems";

/// PostGIS-backed catalogue. The proximity query runs on a 3D GiST index.
#[derive(Clone)]
pub struct PostgresCatalogue {
    pool: PgPool,
}

impl PostgresCatalogue {
    #[tracing::instrument(level = "debug", skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| Error::store("connect postgres", e))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the catalogue table and indexes if missing.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION_0001)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::store("apply migrations", e))?;
        Ok(())
    }

    fn system_from_row(row: &PgRow) -> Result<System> {
        let control_state: Option<String> = row
            .try_get("control_state")
            .map_err(|e| Error::store("control_state", e))?;
        let metadata: Json<SystemMetadata> = row
            .try_get("metadata")
            .map_err(|e| Error::store("metadata", e))?;
        let data: Json<EnrichmentData> =
            row.try_get("data").map_err(|e| Error::store("data", e))?;

        Ok(System {
            id: SystemId::from_i64(row.try_get("id").map_err(|e| Error::store("id", e))?),
            name: row.try_get("name").map_err(|e| Error::store("name", e))?,
            coords: Coords::new(
                row.try_get("x").map_err(|e| Error::store("x", e))?,
                row.try_get("y").map_err(|e| Error::store("y", e))?,
                row.try_get("z").map_err(|e| Error::store("z", e))?,
            ),
            power: row.try_get("power").map_err(|e| Error::store("power", e))?,
            control_state: control_state.map(|s| ControlState::parse(&s)),
            has_ring: row
                .try_get("has_ring")
                .map_err(|e| Error::store("has_ring", e))?,
            resource_sites: ResourceSites {
                hazardous: row
                    .try_get("res_hazardous")
                    .map_err(|e| Error::store("res_hazardous", e))?,
                high: row
                    .try_get("res_high")
                    .map_err(|e| Error::store("res_high", e))?,
                medium: row
                    .try_get("res_medium")
                    .map_err(|e| Error::store("res_medium", e))?,
                low: row
                    .try_get("res_low")
                    .map_err(|e| Error::store("res_low", e))?,
            },
            is_candidate: row
                .try_get("is_candidate")
                .map_err(|e| Error::store("is_candidate", e))?,
            is_interested: row
                .try_get("is_interested")
                .map_err(|e| Error::store("is_interested", e))?,
            freshness: Freshness {
                bulk_updated_at: row
                    .try_get("bulk_updated_at")
                    .map_err(|e| Error::store("bulk_updated_at", e))?,
                control_updated_at: row
                    .try_get("control_updated_at")
                    .map_err(|e| Error::store("control_updated_at", e))?,
                resource_sites_updated_at: row
                    .try_get("resource_sites_updated_at")
                    .map_err(|e| Error::store("resource_sites_updated_at", e))?,
                candidacy_checked_at: row
                    .try_get("candidacy_checked_at")
                    .map_err(|e| Error::store("candidacy_checked_at", e))?,
            },
            metadata: metadata.0,
            data: data.0,
        })
    }

    fn ids_from_rows(rows: &[PgRow]) -> Result<Vec<SystemId>> {
        rows.iter()
            .map(|r| {
                r.try_get::<i64, _>("id")
                    .map(SystemId::from_i64)
                    .map_err(|e| Error::store("id", e))
            })
            .collect()
    }
}

fn outcome(rows_affected: u64) -> MergeOutcome {
    if rows_affected == 0 {
        MergeOutcome::Unknown
    } else {
        MergeOutcome::Merged
    }
}

#[async_trait]
impl CatalogueStore for PostgresCatalogue {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::store("ping postgres", e))?;
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
             WHERE ({col} IS NULL OR {col} <= $1) AND (NOT $2 OR has_ring) \
             ORDER BY {col} ASC NULLS FIRST, id ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(scope.ringed_only)
            .bind(scope.limit.map(|l| l as i64))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::store("stale system ids", e))?;
        Self::ids_from_rows(&rows)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn candidacy_self_heal_ids(&self, limit: Option<usize>) -> Result<Vec<SystemId>> {
        let rows = sqlx::query(
            r#"
SELECT id FROM systems
WHERE GREATEST(bulk_updated_at, control_updated_at, resource_sites_updated_at) IS NOT NULL
  AND (candidacy_checked_at IS NULL
       OR candidacy_checked_at < GREATEST(bulk_updated_at, control_updated_at, resource_sites_updated_at))
ORDER BY id ASC
LIMIT $1
"#,
        )
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("candidacy self-heal ids", e))?;
        Self::ids_from_rows(&rows)
    }

    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()))]
    async fn load_systems(&self, ids: &[SystemId]) -> Result<Vec<System>> {
        let raw: Vec<i64> = ids.iter().map(|id| id.as_i64()).collect();
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE id = ANY($1) ORDER BY id ASC"
        ))
        .bind(&raw)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("load systems", e))?;
        rows.iter().map(Self::system_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, delta), fields(system_id = %delta.system_id, source = %delta.patch.source()))]
    async fn apply_delta(&self, delta: &SystemDelta, at: DateTime<Utc>) -> Result<MergeOutcome> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE systems SET ");
        match &delta.patch {
            DeltaPatch::Bulk(b) => {
                qb.push("name = COALESCE(");
                qb.push_bind(b.name.clone().filter(|n| !n.trim().is_empty()));
                qb.push(", name), has_ring = ");
                qb.push_bind(b.has_ring);
                qb.push(", metadata = metadata || ");
                qb.push_bind(Json(Value::Object(delta.patch.metadata_patch())));
            }
            DeltaPatch::Control(c) => {
                qb.push("power = ");
                qb.push_bind(c.power.clone());
                qb.push(", control_state = ");
                qb.push_bind(c.control_state.as_ref().map(|s| s.as_str().to_string()));
                qb.push(", data = data || ");
                qb.push_bind(Json(Value::Object(delta.patch.data_patch()?)));
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
                qb.push(", data = data || ");
                qb.push_bind(Json(Value::Object(delta.patch.data_patch()?)));
            }
        }
        qb.push(format!(", {} = ", delta.patch.source().column()));
        qb.push_bind(at);
        qb.push(" WHERE id = ");
        qb.push_bind(delta.system_id.as_i64());

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| Error::store("apply delta", e))?;
        Ok(outcome(res.rows_affected()))
    }

    #[tracing::instrument(level = "debug", skip(self, verdict), fields(system_id = %id))]
    async fn record_candidacy(
        &self,
        id: SystemId,
        verdict: &CandidacyVerdict,
        at: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let res = sqlx::query(
            r#"
UPDATE systems
SET is_candidate = $1,
    metadata = metadata || $2,
    candidacy_checked_at = $3
WHERE id = $4
"#,
        )
        .bind(verdict.is_candidate)
        .bind(Json(Value::Object(verdict.metadata_patch()?)))
        .bind(at)
        .bind(id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::store("record candidacy", e))?;
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
        let row = sqlx::query(
            r#"
SELECT id, ST_3DDistance(coords, ST_MakePoint($1, $2, $3)) AS distance_ly
FROM systems
WHERE ST_3DDWithin(coords, ST_MakePoint($1, $2, $3), $4)
  AND id <> $5
  AND power = $6
  AND control_state = ANY($7)
ORDER BY coords <<->> ST_MakePoint($1, $2, $3), id ASC
LIMIT 1
"#,
        )
        .bind(origin.x)
        .bind(origin.y)
        .bind(origin.z)
        .bind(radius_ly)
        .bind(exclude.as_i64())
        .bind(&filter.power)
        .bind(filter.state_names())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::store("nearest anchor", e))?;

        let Some(r) = row else {
            return Ok(None);
        };
        Ok(Some(Anchor {
            system_id: SystemId::from_i64(r.try_get("id").map_err(|e| Error::store("id", e))?),
            distance_ly: r
                .try_get("distance_ly")
                .map_err(|e| Error::store("distance_ly", e))?,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_systems(&self, filter: &SystemFilter, query: ListQuery) -> Result<Vec<System>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_COLUMNS);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id ASC LIMIT ")
            .push_bind(query.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::store("list systems", e))?;
        rows.iter().map(Self::system_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn count_systems(&self, filter: &SystemFilter) -> Result<u64> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) AS n FROM systems");
        push_filter(&mut qb, filter);
        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::store("count systems", e))?;
        let n: i64 = row.try_get("n").map_err(|e| Error::store("count", e))?;
        Ok(n.max(0) as u64)
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SystemFilter) {
    qb.push(" WHERE TRUE");
    if let Some(c) = filter.candidate {
        qb.push(" AND is_candidate = ").push_bind(c);
    }
    if let Some(i) = filter.interested {
        qb.push(" AND COALESCE(is_interested, FALSE) = ").push_bind(i);
    }
    if let Some(p) = &filter.power {
        qb.push(" AND power = ").push_bind(p.clone());
    }
}
