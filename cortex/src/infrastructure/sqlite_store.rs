// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! SQLite Cortex Store
//!
//! Durable [`CortexStore`] backed by a single SQLite file in WAL mode.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Production persistence for patterns, experiences,
//!   Q-values, insights, the audit trail and cortex state
//!
//! Row encoding: ids are TEXT uuids, timestamps RFC3339 TEXT with
//! microseconds (lexically ordered), embeddings little-endian f32 BLOBs,
//! structured columns JSON TEXT. Every pattern row carries a blake3
//! checksum over `payload ‖ embedding`; a mismatch on read is reported as
//! [`StoreError::Corruption`].

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous},
    QueryBuilder, Row, Sqlite, SqlitePool, Transaction,
};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::config::StorageConfig;
use crate::domain::events::CortexEvent;
use crate::domain::experience::{Experience, TaskOutcome, TrajectoryId, TrajectoryStep};
use crate::domain::insight::{Insight, InsightId, InsightKind};
use crate::domain::pattern::{ActionBinding, Pattern, PatternId, PatternStatus, Polarity};
use crate::domain::qe_domain::QeDomain;
use crate::domain::qvalue::{QKey, QValue};
use crate::domain::repository::{
    CortexStore, PatternFilter, StoreCounts, StoreError, WriteBatch, WriteOp,
};
use crate::domain::transfer::DomainTransferEdge;

const PATTERN_COLUMNS: &str = "id, domain, embedding, confidence, usage_count, success_count, \
     failure_count, consecutive_successes, consecutive_failures, status, polarity, state_key, \
     action_key, tags, transferred_from, created_at, last_used_at, payload, checksum";

const EXPERIENCE_COLUMNS: &str =
    "id, task_id, domain, trajectory, used_patterns, outcome, started_at, completed_at, consolidated";

pub struct SqliteCortexStore {
    pool: SqlitePool,
    /// Serializes write transactions inside the process
    write_lock: Mutex<()>,
    busy_retries: u32,
    busy_backoff: Duration,
}

impl SqliteCortexStore {
    /// Open (or create) the database and run pending migrations
    pub async fn connect(config: &StorageConfig) -> Result<Self, StoreError> {
        let path = &config.database_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(format!("Failed to create directory: {e}")))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(config.busy_backoff),
            )
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect to database: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to run migrations: {e}")))?;

        info!(path = %path.display(), "Cortex store opened");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            busy_retries: config.busy_retries,
            busy_backoff: config.busy_backoff,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply_once(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            apply_op(&mut tx, op).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn apply_op(tx: &mut Transaction<'_, Sqlite>, op: &WriteOp) -> Result<(), StoreError> {
    match op {
        WriteOp::PutPattern(pattern) => {
            let embedding = encode_embedding(&pattern.embedding);
            let checksum = pattern_checksum(&pattern.payload, &embedding);
            let (state_key, action_key) = match &pattern.binding {
                Some(b) => (Some(b.state_key.clone()), Some(b.action_key.clone())),
                None => (None, None),
            };
            sqlx::query(
                r"
                INSERT INTO patterns (id, domain, embedding, confidence, usage_count, success_count,
                    failure_count, consecutive_successes, consecutive_failures, status, polarity,
                    state_key, action_key, tags, transferred_from, created_at, last_used_at,
                    payload, checksum)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    domain = excluded.domain,
                    embedding = excluded.embedding,
                    confidence = excluded.confidence,
                    usage_count = excluded.usage_count,
                    success_count = excluded.success_count,
                    failure_count = excluded.failure_count,
                    consecutive_successes = excluded.consecutive_successes,
                    consecutive_failures = excluded.consecutive_failures,
                    status = excluded.status,
                    polarity = excluded.polarity,
                    state_key = excluded.state_key,
                    action_key = excluded.action_key,
                    tags = excluded.tags,
                    transferred_from = excluded.transferred_from,
                    last_used_at = excluded.last_used_at,
                    payload = excluded.payload,
                    checksum = excluded.checksum
                ",
            )
            .bind(pattern.id.to_string())
            .bind(pattern.domain.as_str())
            .bind(embedding)
            .bind(pattern.confidence)
            .bind(pattern.usage_count as i64)
            .bind(pattern.success_count as i64)
            .bind(pattern.failure_count as i64)
            .bind(pattern.consecutive_successes as i64)
            .bind(pattern.consecutive_failures as i64)
            .bind(pattern.status.as_str())
            .bind(polarity_str(pattern.polarity))
            .bind(state_key)
            .bind(action_key)
            .bind(serde_json::to_string(&pattern.tags)?)
            .bind(pattern.transferred_from.map(|id| id.to_string()))
            .bind(format_timestamp(&pattern.created_at))
            .bind(pattern.last_used_at.as_ref().map(format_timestamp))
            .bind(pattern.payload.clone())
            .bind(checksum)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::PutExperience(experience) => {
            // Sealed rows are immutable: the update only applies while open
            let result = sqlx::query(
                r"
                INSERT INTO experiences (id, task_id, domain, trajectory, used_patterns, outcome,
                    started_at, completed_at, consolidated)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    trajectory = excluded.trajectory,
                    used_patterns = excluded.used_patterns,
                    outcome = excluded.outcome,
                    completed_at = excluded.completed_at,
                    consolidated = excluded.consolidated
                WHERE experiences.outcome IS NULL
                ",
            )
            .bind(experience.id.to_string())
            .bind(&experience.task_id)
            .bind(experience.domain.as_str())
            .bind(serde_json::to_string(&experience.trajectory)?)
            .bind(serde_json::to_string(&experience.used_patterns)?)
            .bind(experience.outcome.as_ref().map(serde_json::to_string).transpose()?)
            .bind(format_timestamp(&experience.started_at))
            .bind(experience.completed_at.as_ref().map(format_timestamp))
            .bind(experience.consolidated)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "experience {} is sealed and cannot be rewritten",
                    experience.id
                )));
            }
        }
        WriteOp::PutQValue(qvalue) => {
            sqlx::query(
                r"
                INSERT INTO q_values (domain, state_key, action_key, value, visits, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(domain, state_key, action_key) DO UPDATE SET
                    value = excluded.value,
                    visits = excluded.visits,
                    updated_at = excluded.updated_at
                ",
            )
            .bind(qvalue.key.domain.as_str())
            .bind(&qvalue.key.state_key)
            .bind(&qvalue.key.action_key)
            .bind(qvalue.value)
            .bind(qvalue.visits as i64)
            .bind(format_timestamp(&qvalue.updated_at))
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::PutInsight(insight) => {
            sqlx::query(
                r"
                INSERT INTO insights (id, kind, details, domain, source_pattern_ids, confidence,
                    derived_pattern, applied, description, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    derived_pattern = excluded.derived_pattern,
                    applied = excluded.applied
                ",
            )
            .bind(insight.id.to_string())
            .bind(insight.kind.label())
            .bind(serde_json::to_string(&insight.kind)?)
            .bind(insight.domain.as_str())
            .bind(serde_json::to_string(&insight.source_pattern_ids)?)
            .bind(insight.confidence)
            .bind(insight.derived_pattern.as_ref().map(serde_json::to_string).transpose()?)
            .bind(insight.applied)
            .bind(&insight.description)
            .bind(format_timestamp(&insight.created_at))
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::Audit(event) => {
            let pattern_id = event.pattern_id().ok_or_else(|| {
                StoreError::Conflict(format!("{} event does not name a pattern", event.event_type()))
            })?;
            sqlx::query(
                "INSERT INTO pattern_audit (pattern_id, event_type, event, recorded_at) VALUES (?, ?, ?, ?)",
            )
            .bind(pattern_id.to_string())
            .bind(event.event_type())
            .bind(serde_json::to_string(event)?)
            .bind(format_timestamp(&event.timestamp()))
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::MarkConsolidated(ids) => {
            for id in ids {
                sqlx::query("UPDATE experiences SET consolidated = 1 WHERE id = ? AND outcome IS NOT NULL")
                    .bind(id.to_string())
                    .execute(&mut **tx)
                    .await?;
            }
        }
        WriteOp::PutState { key, value } => {
            sqlx::query(
                r"
                INSERT INTO cortex_state (key, value, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                ",
            )
            .bind(key)
            .bind(serde_json::to_string(value)?)
            .bind(format_timestamp(&Utc::now()))
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::ReplaceTransferEdges(edges) => {
            sqlx::query("DELETE FROM domain_transfer_edges")
                .execute(&mut **tx)
                .await?;
            for edge in edges {
                sqlx::query(
                    "INSERT INTO domain_transfer_edges (source_domain, target_domain, weight) VALUES (?, ?, ?)",
                )
                .bind(edge.source.as_str())
                .bind(edge.target.as_str())
                .bind(edge.weight)
                .execute(&mut **tx)
                .await?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl CortexStore for SqliteCortexStore {
    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _writer = self.write_lock.lock().await;

        let mut backoff = self.busy_backoff;
        let mut attempt = 0;
        loop {
            match self.apply_once(batch.ops()).await {
                Err(StoreError::Busy(reason)) if attempt < self.busy_retries => {
                    attempt += 1;
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, %reason, "Store busy, retrying write");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(StoreError::Busy(reason)) => {
                    warn!(attempts = attempt + 1, %reason, "Store still busy after bounded retries");
                    return Err(StoreError::Busy(reason));
                }
                other => return other,
            }
        }
    }

    async fn get_pattern(&self, id: PatternId) -> Result<Pattern, StoreError> {
        let row = sqlx::query(&format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("pattern {id}")))?;
        pattern_from_row(&row)
    }

    async fn query_patterns(&self, filter: &PatternFilter) -> Result<Vec<Pattern>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE 1 = 1"));
        if let Some(domain) = filter.domain {
            qb.push(" AND domain = ").push_bind(domain.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(min_confidence) = filter.min_confidence {
            qb.push(" AND confidence >= ").push_bind(min_confidence);
        }
        qb.push(" ORDER BY confidence DESC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(pattern_from_row).collect()
    }

    async fn find_patterns_by_binding(
        &self,
        domain: QeDomain,
        binding: &ActionBinding,
    ) -> Result<Vec<Pattern>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns WHERE domain = ? AND state_key = ? AND action_key = ? ORDER BY id"
        ))
        .bind(domain.as_str())
        .bind(&binding.state_key)
        .bind(&binding.action_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pattern_from_row).collect()
    }

    async fn find_transferred_copies(&self, source: PatternId) -> Result<Vec<Pattern>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns WHERE transferred_from = ? ORDER BY domain"
        ))
        .bind(source.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pattern_from_row).collect()
    }

    async fn get_experience(&self, id: TrajectoryId) -> Result<Experience, StoreError> {
        let row = sqlx::query(&format!("SELECT {EXPERIENCE_COLUMNS} FROM experiences WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("experience {id}")))?;
        experience_from_row(&row)
    }

    async fn get_recent_experiences(
        &self,
        domain: Option<QeDomain>,
        limit: usize,
    ) -> Result<Vec<Experience>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {EXPERIENCE_COLUMNS} FROM experiences WHERE outcome IS NOT NULL"
        ));
        if let Some(domain) = domain {
            qb.push(" AND domain = ").push_bind(domain.as_str());
        }
        qb.push(" ORDER BY completed_at DESC, id ASC LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(experience_from_row).collect()
    }

    async fn get_unconsolidated_experiences(&self, limit: usize) -> Result<Vec<Experience>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPERIENCE_COLUMNS} FROM experiences \
             WHERE outcome IS NOT NULL AND consolidated = 0 \
             ORDER BY completed_at ASC, id ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(experience_from_row).collect()
    }

    async fn get_open_experiences(&self) -> Result<Vec<Experience>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPERIENCE_COLUMNS} FROM experiences WHERE outcome IS NULL ORDER BY started_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(experience_from_row).collect()
    }

    async fn get_qvalue(&self, key: &QKey) -> Result<Option<QValue>, StoreError> {
        let row = sqlx::query(
            "SELECT domain, state_key, action_key, value, visits, updated_at FROM q_values \
             WHERE domain = ? AND state_key = ? AND action_key = ?",
        )
        .bind(key.domain.as_str())
        .bind(&key.state_key)
        .bind(&key.action_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(qvalue_from_row).transpose()
    }

    async fn get_qvalues_for_state(
        &self,
        domain: QeDomain,
        state_key: &str,
    ) -> Result<Vec<QValue>, StoreError> {
        let rows = sqlx::query(
            "SELECT domain, state_key, action_key, value, visits, updated_at FROM q_values \
             WHERE domain = ? AND state_key = ? ORDER BY action_key",
        )
        .bind(domain.as_str())
        .bind(state_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(qvalue_from_row).collect()
    }

    async fn get_insights(
        &self,
        domain: Option<QeDomain>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Insight>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, details, domain, source_pattern_ids, confidence, derived_pattern, applied, \
             description, created_at FROM insights WHERE 1 = 1",
        );
        if let Some(domain) = domain {
            qb.push(" AND domain = ").push_bind(domain.as_str());
        }
        if let Some(since) = since {
            qb.push(" AND created_at >= ").push_bind(format_timestamp(&since));
        }
        qb.push(" ORDER BY created_at DESC, id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(insight_from_row).collect()
    }

    async fn get_pattern_audit(&self, id: PatternId) -> Result<Vec<CortexEvent>, StoreError> {
        let rows = sqlx::query("SELECT event FROM pattern_audit WHERE pattern_id = ? ORDER BY seq ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let json: String = row.try_get("event")?;
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }

    async fn load_transfer_edges(&self) -> Result<Vec<DomainTransferEdge>, StoreError> {
        let rows = sqlx::query(
            "SELECT source_domain, target_domain, weight FROM domain_transfer_edges \
             ORDER BY source_domain, target_domain",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DomainTransferEdge {
                    source: parse_domain(row, "source_domain")?,
                    target: parse_domain(row, "target_domain")?,
                    weight: row.try_get("weight")?,
                })
            })
            .collect()
    }

    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM cortex_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                (SELECT COUNT(*) FROM patterns) AS total_patterns,
                (SELECT COUNT(*) FROM patterns WHERE status = 'short_term') AS short_term,
                (SELECT COUNT(*) FROM patterns WHERE status = 'long_term') AS long_term,
                (SELECT COUNT(*) FROM patterns WHERE status = 'quarantined') AS quarantined,
                (SELECT COUNT(*) FROM experiences) AS total_experiences,
                (SELECT COUNT(*) FROM experiences WHERE outcome IS NULL) AS open_experiences,
                (SELECT COUNT(*) FROM experiences WHERE outcome IS NOT NULL AND consolidated = 0) AS backlog,
                (SELECT COUNT(*) FROM q_values) AS q_values,
                (SELECT COUNT(*) FROM insights) AS insights,
                (SELECT COUNT(*) FROM insights WHERE applied = 1) AS applied_insights
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, StoreError> { Ok(row.try_get::<i64, _>(column)? as u64) };
        Ok(StoreCounts {
            total_patterns: count("total_patterns")?,
            short_term_patterns: count("short_term")?,
            long_term_patterns: count("long_term")?,
            quarantined_patterns: count("quarantined")?,
            total_experiences: count("total_experiences")?,
            open_experiences: count("open_experiences")?,
            unconsolidated_experiences: count("backlog")?,
            q_values: count("q_values")?,
            insights: count("insights")?,
            applied_insights: count("applied_insights")?,
        })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut => StoreError::Busy(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(db.message().to_string()),
            sqlx::Error::Database(db) if is_busy_code(db.code().as_deref(), db.message()) => {
                StoreError::Busy(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Serialization(err.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// SQLITE_BUSY, SQLITE_LOCKED and their extended codes
fn is_busy_code(code: Option<&str>, message: &str) -> bool {
    matches!(code, Some("5") | Some("6") | Some("261") | Some("262") | Some("517"))
        || message.contains("database is locked")
        || message.contains("database table is locked")
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(Into::into)
        .map_err(|e| StoreError::Serialization(format!("Invalid {column} timestamp '{raw}': {e}")))
}

fn parse_optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(Into::into)
            .map_err(|e| StoreError::Serialization(format!("Invalid {column} timestamp '{s}': {e}")))
    })
    .transpose()
}

fn parse_domain(row: &SqliteRow, column: &str) -> Result<QeDomain, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: crate::domain::qe_domain::UnknownDomain| StoreError::Serialization(e.to_string()))
}

fn parse_uuid_column<T: std::str::FromStr<Err = uuid::Error>>(raw: &str, column: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Serialization(format!("Invalid {column} '{raw}': {e}")))
}

fn polarity_str(polarity: Polarity) -> &'static str {
    match polarity {
        Polarity::Positive => "positive",
        Polarity::Negative => "negative",
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn pattern_checksum(payload: &[u8], embedding: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(payload);
    hasher.update(embedding);
    hasher.finalize().to_hex().to_string()
}

fn pattern_from_row(row: &SqliteRow) -> Result<Pattern, StoreError> {
    let id_raw: String = row.try_get("id")?;
    let embedding_bytes: Vec<u8> = row.try_get("embedding")?;
    let payload: Vec<u8> = row.try_get("payload")?;
    let checksum: String = row.try_get("checksum")?;

    if pattern_checksum(&payload, &embedding_bytes) != checksum {
        return Err(StoreError::Corruption(format!("checksum mismatch on pattern {id_raw}")));
    }
    let embedding = decode_embedding(&embedding_bytes)
        .ok_or_else(|| StoreError::Corruption(format!("truncated embedding on pattern {id_raw}")))?;

    let status_raw: String = row.try_get("status")?;
    let status: PatternStatus = status_raw.parse().map_err(StoreError::Serialization)?;
    let polarity = match row.try_get::<String, _>("polarity")?.as_str() {
        "negative" => Polarity::Negative,
        _ => Polarity::Positive,
    };
    let state_key: Option<String> = row.try_get("state_key")?;
    let action_key: Option<String> = row.try_get("action_key")?;
    let binding = match (state_key, action_key) {
        (Some(state_key), Some(action_key)) => Some(ActionBinding { state_key, action_key }),
        _ => None,
    };
    let tags_raw: String = row.try_get("tags")?;
    let transferred_from: Option<String> = row.try_get("transferred_from")?;

    Ok(Pattern {
        id: parse_uuid_column(&id_raw, "id")?,
        domain: parse_domain(row, "domain")?,
        embedding,
        confidence: row.try_get("confidence")?,
        usage_count: row.try_get::<i64, _>("usage_count")? as u64,
        success_count: row.try_get::<i64, _>("success_count")? as u64,
        failure_count: row.try_get::<i64, _>("failure_count")? as u64,
        consecutive_successes: row.try_get::<i64, _>("consecutive_successes")? as u32,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        status,
        polarity,
        binding,
        tags: serde_json::from_str(&tags_raw)?,
        transferred_from: transferred_from
            .map(|raw| parse_uuid_column(&raw, "transferred_from"))
            .transpose()?,
        created_at: parse_timestamp(row, "created_at")?,
        last_used_at: parse_optional_timestamp(row, "last_used_at")?,
        payload,
    })
}

fn experience_from_row(row: &SqliteRow) -> Result<Experience, StoreError> {
    let id_raw: String = row.try_get("id")?;
    let trajectory_raw: String = row.try_get("trajectory")?;
    let used_raw: String = row.try_get("used_patterns")?;
    let outcome_raw: Option<String> = row.try_get("outcome")?;

    let trajectory: Vec<TrajectoryStep> = serde_json::from_str(&trajectory_raw)?;
    let used_patterns: Vec<PatternId> = serde_json::from_str(&used_raw)?;
    let outcome: Option<TaskOutcome> = outcome_raw.map(|raw| serde_json::from_str(&raw)).transpose()?;

    Ok(Experience {
        id: parse_uuid_column(&id_raw, "id")?,
        task_id: row.try_get("task_id")?,
        domain: parse_domain(row, "domain")?,
        trajectory,
        used_patterns,
        outcome,
        started_at: parse_timestamp(row, "started_at")?,
        completed_at: parse_optional_timestamp(row, "completed_at")?,
        consolidated: row.try_get("consolidated")?,
    })
}

fn qvalue_from_row(row: &SqliteRow) -> Result<QValue, StoreError> {
    Ok(QValue {
        key: QKey {
            domain: parse_domain(row, "domain")?,
            state_key: row.try_get("state_key")?,
            action_key: row.try_get("action_key")?,
        },
        value: row.try_get("value")?,
        visits: row.try_get::<i64, _>("visits")? as u64,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}

fn insight_from_row(row: &SqliteRow) -> Result<Insight, StoreError> {
    let id_raw: String = row.try_get("id")?;
    let details: String = row.try_get("details")?;
    let sources_raw: String = row.try_get("source_pattern_ids")?;
    let derived_raw: Option<String> = row.try_get("derived_pattern")?;

    let kind: InsightKind = serde_json::from_str(&details)?;
    let source_pattern_ids: Vec<PatternId> = serde_json::from_str(&sources_raw)?;
    let derived_pattern: Option<Pattern> = derived_raw.map(|raw| serde_json::from_str(&raw)).transpose()?;

    Ok(Insight {
        id: InsightId(parse_uuid_column(&id_raw, "id")?),
        kind,
        domain: parse_domain(row, "domain")?,
        source_pattern_ids,
        confidence: row.try_get("confidence")?,
        derived_pattern,
        applied: row.try_get("applied")?,
        description: row.try_get("description")?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}
