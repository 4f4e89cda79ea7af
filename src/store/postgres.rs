use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{
    postgres::{PgArguments, PgPoolOptions, PgRow},
    query::Query,
    PgConnection, PgPool, Postgres, Row,
};
use tracing::info;

use super::{
    bump_session_sql, by_key_sql, cascade_delete_sql, exists_sql, insert_sql, list_histories_sql,
    list_proposals_sql, list_sessions_sql, update_session_sql, RecordStore,
};
use crate::{
    error::StoreError,
    models::{now, History, Proposal, Session, SessionPatch},
    schema_mapper::{self, parse_timestamp, BackendKind, Entity, FieldKind, RawRow},
};

const BACKEND: BackendKind = BackendKind::Postgres;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        name TEXT,
        correction_count BIGINT NOT NULL DEFAULT 0,
        is_open BOOLEAN NOT NULL DEFAULT TRUE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS correction_histories (
        history_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(session_id),
        "timestamp" TIMESTAMPTZ NOT NULL,
        original_text TEXT NOT NULL,
        instruction_prompt TEXT,
        target_text TEXT NOT NULL,
        combined_comment TEXT,
        selected_proposal_ids JSONB,
        custom_proposals JSONB
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_histories_session
        ON correction_histories(session_id, "timestamp" DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS ai_proposals (
        seq BIGSERIAL,
        proposal_id TEXT PRIMARY KEY,
        history_id TEXT NOT NULL REFERENCES correction_histories(history_id),
        "type" TEXT NOT NULL,
        original_after_text TEXT NOT NULL,
        original_reason TEXT,
        modified_after_text TEXT,
        modified_reason TEXT,
        is_selected BOOLEAN NOT NULL DEFAULT FALSE,
        is_modified BOOLEAN NOT NULL DEFAULT FALSE,
        is_custom BOOLEAN NOT NULL DEFAULT FALSE,
        selected_order BIGINT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_proposals_history ON ai_proposals(history_id)"#,
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_foreign_key_violation()
                    || db.is_unique_violation()
                    || db.is_check_violation() =>
            {
                StoreError::validation(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => StoreError::decode(BACKEND, err.to_string()),
            _ => StoreError::unavailable(BACKEND, err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Builds the pool without connecting; connection failures surface on the
    /// first call as `BackendUnavailable`.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("PostgreSQL schema ready");
        Ok(())
    }
}

fn read_row(row: &PgRow, entity: Entity) -> Result<RawRow, sqlx::Error> {
    let mut raw = RawRow::new();
    for spec in schema_mapper::fields(entity) {
        let name = spec.column(BACKEND);
        let value = match spec.kind {
            FieldKind::Text => row.try_get::<Option<String>, _>(name)?.map(Value::String),
            FieldKind::Integer => row.try_get::<Option<i64>, _>(name)?.map(Value::from),
            FieldKind::Boolean => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
            FieldKind::Timestamp => row
                .try_get::<Option<DateTime<Utc>>, _>(name)?
                .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))),
            FieldKind::JsonList => row.try_get::<Option<Value>, _>(name)?,
        };
        raw.insert(name.to_string(), value.unwrap_or(Value::Null));
    }
    Ok(raw)
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    kind: FieldKind,
    value: Value,
) -> Query<'q, Postgres, PgArguments> {
    match kind {
        FieldKind::Text => query.bind(value.as_str().map(str::to_owned)),
        FieldKind::Integer => query.bind(value.as_i64()),
        FieldKind::Boolean => query.bind(value.as_bool()),
        FieldKind::Timestamp => query.bind(parse_timestamp(&value)),
        FieldKind::JsonList => query.bind((!value.is_null()).then_some(value)),
    }
}

fn decode_rows<T: serde::de::DeserializeOwned>(
    rows: &[PgRow],
    entity: Entity,
) -> Result<Vec<T>, StoreError> {
    rows.iter()
        .map(|row| {
            let raw = read_row(row, entity)?;
            schema_mapper::decode(BACKEND, entity, &raw)
        })
        .collect()
}

async fn fetch_one<T: serde::de::DeserializeOwned>(
    conn: &mut PgConnection,
    entity: Entity,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let sql = by_key_sql(BACKEND, entity);
    let row = sqlx::query(&sql).bind(key).fetch_optional(conn).await?;
    match row {
        Some(row) => {
            let raw = read_row(&row, entity)?;
            schema_mapper::decode(BACKEND, entity, &raw).map(Some)
        }
        None => Ok(None),
    }
}

async fn exists(conn: &mut PgConnection, entity: Entity, key: &str) -> Result<bool, StoreError> {
    let sql = exists_sql(BACKEND, entity);
    let row = sqlx::query(&sql).bind(key).fetch_optional(conn).await?;
    Ok(row.is_some())
}

async fn insert<T: serde::Serialize>(
    conn: &mut PgConnection,
    entity: Entity,
    record: &T,
) -> Result<(), StoreError> {
    let row = schema_mapper::encode(BACKEND, entity, record)?;
    let sql = insert_sql(BACKEND, entity);
    let mut query = sqlx::query(&sql);
    for spec in schema_mapper::fields(entity) {
        let value = row.get(spec.column(BACKEND)).cloned().unwrap_or(Value::Null);
        query = bind_value(query, spec.kind, value);
    }
    query.execute(conn).await?;
    Ok(())
}

#[async_trait]
impl RecordStore for PgStore {
    fn backend(&self) -> BackendKind {
        BACKEND
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let sql = list_sessions_sql(BACKEND);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        decode_rows(&rows, Entity::Session)
    }

    async fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, Entity::Session, &session).await?;
        Ok(session)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_one(&mut conn, Entity::Session, session_id).await
    }

    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !exists(&mut tx, Entity::Session, session_id).await? {
            return Ok(None);
        }
        if !patch.is_empty() {
            let mut patch = patch;
            if patch.updated_at.is_none() {
                patch.updated_at = Some(now());
            }
            let assignments = schema_mapper::patch_assignments(BACKEND, &patch);
            let columns = assignments.iter().map(|(c, _)| *c).collect::<Vec<_>>();
            let sql = update_session_sql(BACKEND, &columns);
            let mut query = sqlx::query(&sql);
            for (column, value) in assignments {
                let kind = schema_mapper::fields(Entity::Session)
                    .iter()
                    .find(|spec| spec.column(BACKEND) == column)
                    .map(|spec| spec.kind)
                    .unwrap_or(FieldKind::Text);
                query = bind_value(query, kind, value);
            }
            query.bind(session_id).execute(&mut *tx).await?;
        }
        let updated = fetch_one(&mut tx, Entity::Session, session_id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for sql in cascade_delete_sql(BACKEND) {
            sqlx::query(&sql).bind(session_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_histories(&self, session_id: &str) -> Result<Vec<History>, StoreError> {
        let sql = list_histories_sql(BACKEND);
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        decode_rows(&rows, Entity::History)
    }

    async fn create_history(&self, history: History) -> Result<History, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !exists(&mut tx, Entity::Session, &history.session_id).await? {
            return Err(StoreError::validation(format!(
                "session `{}` does not exist",
                history.session_id
            )));
        }
        insert(&mut tx, Entity::History, &history).await?;
        sqlx::query(&bump_session_sql(BACKEND))
            .bind(history.timestamp)
            .bind(&history.session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(history)
    }

    async fn list_proposals(&self, history_id: &str) -> Result<Vec<Proposal>, StoreError> {
        let sql = list_proposals_sql(BACKEND);
        let rows = sqlx::query(&sql)
            .bind(history_id)
            .fetch_all(&self.pool)
            .await?;
        decode_rows(&rows, Entity::Proposal)
    }

    async fn create_proposal(&self, proposal: Proposal) -> Result<Proposal, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !exists(&mut tx, Entity::History, &proposal.history_id).await? {
            return Err(StoreError::validation(format!(
                "history `{}` does not exist",
                proposal.history_id
            )));
        }
        insert(&mut tx, Entity::Proposal, &proposal).await?;
        tx.commit().await?;
        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_database_reports_backend_unavailable() {
        let store = PgStore::connect_lazy("postgres://nobody@127.0.0.1:1/none", 1).unwrap();
        let err = store.list_sessions().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
        assert!(matches!(
            err,
            StoreError::BackendUnavailable {
                backend: BackendKind::Postgres,
                ..
            }
        ));
    }
}
