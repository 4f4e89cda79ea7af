use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::{
    params, params_from_iter,
    types::{Value as SqlValue, ValueRef},
    Connection, ErrorCode, OptionalExtension, Row,
};
use serde_json::{Number, Value};
use tracing::info;

use super::{
    bump_session_sql, by_key_sql, cascade_delete_sql, exists_sql, insert_sql, list_histories_sql,
    list_proposals_sql, list_sessions_sql, update_session_sql, RecordStore,
};
use crate::{
    error::StoreError,
    models::{now, History, Proposal, Session, SessionPatch},
    schema_mapper::{self, BackendKind, Entity, RawRow},
};

const BACKEND: BackendKind = BackendKind::Sqlite;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS "Sessions" (
    "sessionId" TEXT PRIMARY KEY,
    "createdAt" TEXT NOT NULL,
    "updatedAt" TEXT NOT NULL,
    "name" TEXT,
    "correctionCount" INTEGER NOT NULL DEFAULT 0,
    "isOpen" INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS "CorrectionHistories" (
    "historyId" TEXT PRIMARY KEY,
    "sessionId" TEXT NOT NULL REFERENCES "Sessions"("sessionId"),
    "timestamp" TEXT NOT NULL,
    "originalText" TEXT NOT NULL,
    "instructionPrompt" TEXT,
    "targetText" TEXT NOT NULL,
    "combinedComment" TEXT,
    "selectedProposalIds" TEXT,
    "customProposals" TEXT
);
CREATE INDEX IF NOT EXISTS "idx_histories_session"
    ON "CorrectionHistories"("sessionId", "timestamp");
CREATE TABLE IF NOT EXISTS "AIProposals" (
    "proposalId" TEXT PRIMARY KEY,
    "historyId" TEXT NOT NULL REFERENCES "CorrectionHistories"("historyId"),
    "type" TEXT NOT NULL,
    "originalAfterText" TEXT NOT NULL,
    "originalReason" TEXT,
    "modifiedAfterText" TEXT,
    "modifiedReason" TEXT,
    "isSelected" INTEGER NOT NULL DEFAULT 0,
    "isModified" INTEGER NOT NULL DEFAULT 0,
    "isCustom" INTEGER NOT NULL DEFAULT 0,
    "selectedOrder" INTEGER
);
CREATE INDEX IF NOT EXISTS "idx_proposals_history" ON "AIProposals"("historyId");
"#;

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::validation(err.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => {
                StoreError::decode(BACKEND, err.to_string())
            }
            _ => StoreError::unavailable(BACKEND, err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::unavailable(
                    BACKEND,
                    format!("failed to create {}: {err}", parent.display()),
                )
            })?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "SQLite store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::unavailable(BACKEND, "connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::unavailable(BACKEND, format!("task join error: {err}")))?
    }
}

fn read_row(row: &Row<'_>, entity: Entity) -> rusqlite::Result<RawRow> {
    let mut raw = RawRow::new();
    for (idx, name) in schema_mapper::columns(BACKEND, entity).into_iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        };
        raw.insert(name.to_string(), value);
    }
    Ok(raw)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Row values in column order, ready for `params_from_iter`.
fn row_params(entity: Entity, row: &RawRow) -> Vec<SqlValue> {
    schema_mapper::columns(BACKEND, entity)
        .into_iter()
        .map(|name| row.get(name).map(to_sql_value).unwrap_or(SqlValue::Null))
        .collect()
}

fn query_all<T, P>(conn: &Connection, entity: Entity, sql: &str, params: P) -> Result<Vec<T>, StoreError>
where
    T: serde::de::DeserializeOwned,
    P: rusqlite::Params,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| read_row(row, entity))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.iter()
        .map(|raw| schema_mapper::decode(BACKEND, entity, raw))
        .collect()
}

fn query_one<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    entity: Entity,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let raw = conn
        .query_row(&by_key_sql(BACKEND, entity), params![key], |row| {
            read_row(row, entity)
        })
        .optional()?;
    raw.map(|raw| schema_mapper::decode(BACKEND, entity, &raw))
        .transpose()
}

fn exists(conn: &Connection, entity: Entity, key: &str) -> Result<bool, StoreError> {
    let found = conn
        .query_row(&exists_sql(BACKEND, entity), params![key], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn insert<T: serde::Serialize>(conn: &Connection, entity: Entity, record: &T) -> Result<(), StoreError> {
    let row = schema_mapper::encode(BACKEND, entity, record)?;
    conn.execute(
        &insert_sql(BACKEND, entity),
        params_from_iter(row_params(entity, &row)),
    )?;
    Ok(())
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn backend(&self) -> BackendKind {
        BACKEND
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.call(|conn| query_all(conn, Entity::Session, &list_sessions_sql(BACKEND), []))
            .await
    }

    async fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        self.call(move |conn| {
            insert(conn, Entity::Session, &session)?;
            Ok(session)
        })
        .await
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let session_id = session_id.to_string();
        self.call(move |conn| query_one(conn, Entity::Session, &session_id))
            .await
    }

    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        let session_id = session_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            if !exists(&tx, Entity::Session, &session_id)? {
                return Ok(None);
            }
            if !patch.is_empty() {
                let mut patch = patch;
                if patch.updated_at.is_none() {
                    patch.updated_at = Some(now());
                }
                let assignments = schema_mapper::patch_assignments(BACKEND, &patch);
                let columns = assignments.iter().map(|(c, _)| *c).collect::<Vec<_>>();
                let mut values = assignments
                    .iter()
                    .map(|(_, v)| to_sql_value(v))
                    .collect::<Vec<_>>();
                values.push(SqlValue::Text(session_id.clone()));
                tx.execute(
                    &update_session_sql(BACKEND, &columns),
                    params_from_iter(values),
                )?;
            }
            let updated = query_one(&tx, Entity::Session, &session_id)?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for sql in cascade_delete_sql(BACKEND) {
                tx.execute(&sql, params![session_id])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_histories(&self, session_id: &str) -> Result<Vec<History>, StoreError> {
        let session_id = session_id.to_string();
        self.call(move |conn| {
            query_all(
                conn,
                Entity::History,
                &list_histories_sql(BACKEND),
                params![session_id],
            )
        })
        .await
    }

    async fn create_history(&self, history: History) -> Result<History, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            if !exists(&tx, Entity::Session, &history.session_id)? {
                return Err(StoreError::validation(format!(
                    "session `{}` does not exist",
                    history.session_id
                )));
            }
            insert(&tx, Entity::History, &history)?;
            let touched_at = schema_mapper::encode_timestamp(BACKEND, history.timestamp);
            tx.execute(
                &bump_session_sql(BACKEND),
                params![to_sql_value(&touched_at), history.session_id.as_str()],
            )?;
            tx.commit()?;
            Ok(history)
        })
        .await
    }

    async fn list_proposals(&self, history_id: &str) -> Result<Vec<Proposal>, StoreError> {
        let history_id = history_id.to_string();
        self.call(move |conn| {
            query_all(
                conn,
                Entity::Proposal,
                &list_proposals_sql(BACKEND),
                params![history_id],
            )
        })
        .await
    }

    async fn create_proposal(&self, proposal: Proposal) -> Result<Proposal, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            if !exists(&tx, Entity::History, &proposal.history_id)? {
                return Err(StoreError::validation(format!(
                    "history `{}` does not exist",
                    proposal.history_id
                )));
            }
            insert(&tx, Entity::Proposal, &proposal)?;
            tx.commit()?;
            Ok(proposal)
        })
        .await
    }
}
