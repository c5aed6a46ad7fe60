use crate::{entry::AuditEntry, error::*, query::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

/// Append-only sink. `record` either durably persists the entry or errors;
/// there is no update or delete.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;

    async fn search(&self, query: AuditQuery) -> Result<AuditPage>;
}

/// In-memory sink for tests and single-process deployments. Entries are held
/// in arrival order behind a lock that is only taken briefly.
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        debug!(event = %entry.event, actor = %entry.actor, "recording audit entry");
        self.entries.write().push(entry);
        Ok(())
    }

    async fn search(&self, query: AuditQuery) -> Result<AuditPage> {
        let entries = self.entries.read();
        let matches: Vec<&AuditEntry> = entries.iter().filter(|e| query.matches(e)).collect();
        let total = matches.len();
        let page = matches
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .cloned()
            .collect();

        Ok(AuditPage {
            entries: page,
            total,
            offset: query.offset,
        })
    }
}

/// PostgreSQL-backed sink.
///
/// Expected schema:
///
/// ```sql
/// CREATE TABLE audit_entries (
///     id          UUID PRIMARY KEY,
///     recorded_at TIMESTAMPTZ NOT NULL,
///     event       TEXT NOT NULL,
///     actor       UUID NOT NULL,
///     target      TEXT NOT NULL,
///     before_value JSONB,
///     after_value  JSONB,
///     decision     JSONB
/// );
/// -- No UPDATE or DELETE is ever issued against this table; revoke those
/// -- privileges from the application role.
/// ```
pub struct PostgresAuditSink {
    pool: PgPool,
}

impl PostgresAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        let decision = entry
            .decision
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| AuditError::Unavailable(format!("Failed to encode decision: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO audit_entries (
                id, recorded_at, event, actor, target,
                before_value, after_value, decision
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.timestamp)
        .bind(entry.event.code())
        .bind(entry.actor)
        .bind(&entry.target)
        .bind(&entry.before)
        .bind(&entry.after)
        .bind(&decision)
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::Unavailable(format!("Failed to record entry: {}", e)))?;

        Ok(())
    }

    async fn search(&self, query: AuditQuery) -> Result<AuditPage> {
        let limit = query.effective_limit();
        let rows = sqlx::query(
            r#"
            SELECT id, recorded_at, event, actor, target,
                   before_value, after_value, decision,
                   COUNT(*) OVER () AS total
            FROM audit_entries
            WHERE ($1::uuid IS NULL OR actor = $1)
              AND ($2::text IS NULL OR event = $2)
              AND ($3::text IS NULL OR target LIKE '%' || $3 || '%')
              AND ($4::timestamptz IS NULL OR recorded_at >= $4)
              AND ($5::timestamptz IS NULL OR recorded_at <= $5)
            ORDER BY recorded_at ASC
            OFFSET $6 LIMIT $7
            "#,
        )
        .bind(query.actor)
        .bind(query.event.map(|e| e.code().to_string()))
        .bind(query.target.clone())
        .bind(query.from)
        .bind(query.to)
        .bind(query.offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditError::Unavailable(format!("Failed to search entries: {}", e)))?;

        let total = rows
            .first()
            .map(|row| row.try_get::<i64, _>("total").unwrap_or(0) as usize)
            .unwrap_or(0);

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(row_to_entry(&row)?);
        }

        Ok(AuditPage {
            entries,
            total,
            offset: query.offset,
        })
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<AuditEntry> {
    let event_code: String = row
        .try_get("event")
        .map_err(|e| AuditError::Unavailable(e.to_string()))?;
    let event = parse_event(&event_code)?;
    let decision: Option<serde_json::Value> = row
        .try_get("decision")
        .map_err(|e| AuditError::Unavailable(e.to_string()))?;
    let decision = decision
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| AuditError::Unavailable(format!("Malformed decision record: {}", e)))?;

    Ok(AuditEntry {
        id: get(row, "id")?,
        timestamp: get::<DateTime<Utc>>(row, "recorded_at")?,
        event,
        actor: get::<Uuid>(row, "actor")?,
        target: get(row, "target")?,
        before: get(row, "before_value")?,
        after: get(row, "after_value")?,
        decision,
    })
}

fn get<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| AuditError::Unavailable(format!("Column {}: {}", column, e)))
}

fn parse_event(code: &str) -> Result<crate::entry::AuditEvent> {
    use crate::entry::AuditEvent::*;
    Ok(match code {
        "role.assigned" => RoleAssigned,
        "role.revoked" => RoleRevoked,
        "role.expired" => RoleExpired,
        "acl.granted" => AclGranted,
        "acl.revoked" => AclRevoked,
        "acl.extended" => AclExtended,
        "acl.expired" => AclExpired,
        "access.decided" => AccessDecided,
        other => {
            return Err(AuditError::Unavailable(format!(
                "Unknown event code in store: {}",
                other
            )))
        }
    })
}
