//! Record stores: one capability contract, one implementation per backend.
//!
//! SQL text is built here from the [`schema_mapper`] field tables so neither
//! backend spells out its own column lists.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;

use crate::{
    error::StoreError,
    models::{History, Proposal, Session, SessionPatch},
    schema_mapper::{self, BackendKind, Entity},
};

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

/// Session, history and proposal operations shared by every backend.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Sessions ordered by `updatedAt`, most recent first.
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn create_session(&self, session: Session) -> Result<Session, StoreError>;

    async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Applies the allow-listed fields of `patch`. Returns `None` when the
    /// session does not exist.
    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Option<Session>, StoreError>;

    /// Removes the session with its histories and their proposals. Deleting a
    /// missing session succeeds.
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Histories of a session ordered by `timestamp`, most recent first.
    async fn list_histories(&self, session_id: &str) -> Result<Vec<History>, StoreError>;

    /// Inserts the history and bumps the owning session's correction count.
    async fn create_history(&self, history: History) -> Result<History, StoreError>;

    /// Proposals of a history ordered by `selectedOrder`, unordered ones last.
    async fn list_proposals(&self, history_id: &str) -> Result<Vec<Proposal>, StoreError>;

    async fn create_proposal(&self, proposal: Proposal) -> Result<Proposal, StoreError>;
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

pub(crate) fn placeholder(backend: BackendKind, index: usize) -> String {
    match backend {
        BackendKind::Postgres => format!("${index}"),
        BackendKind::Sqlite => format!("?{index}"),
    }
}

pub(crate) fn table(backend: BackendKind, entity: Entity) -> String {
    quote(schema_mapper::table_name(backend, entity))
}

pub(crate) fn column(backend: BackendKind, entity: Entity, canonical: &str) -> String {
    let name = schema_mapper::column_name(backend, entity, canonical).unwrap_or(canonical);
    quote(name)
}

/// `SELECT <all mapped columns> FROM <table>`.
pub(crate) fn select_sql(backend: BackendKind, entity: Entity) -> String {
    let columns = schema_mapper::columns(backend, entity)
        .into_iter()
        .map(quote)
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {columns} FROM {}", table(backend, entity))
}

pub(crate) fn insert_sql(backend: BackendKind, entity: Entity) -> String {
    let columns = schema_mapper::columns(backend, entity);
    let names = columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let values = (1..=columns.len())
        .map(|i| placeholder(backend, i))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({names}) VALUES ({values})",
        table(backend, entity)
    )
}

/// `SELECT 1 FROM <table> WHERE <key> = <placeholder 1>`.
pub(crate) fn exists_sql(backend: BackendKind, entity: Entity) -> String {
    let key = schema_mapper::key_field(entity).column(backend);
    format!(
        "SELECT 1 FROM {} WHERE {} = {}",
        table(backend, entity),
        quote(key),
        placeholder(backend, 1)
    )
}

pub(crate) fn by_key_sql(backend: BackendKind, entity: Entity) -> String {
    let key = schema_mapper::key_field(entity).column(backend);
    format!(
        "{} WHERE {} = {}",
        select_sql(backend, entity),
        quote(key),
        placeholder(backend, 1)
    )
}

pub(crate) fn list_sessions_sql(backend: BackendKind) -> String {
    format!(
        "{} ORDER BY {} DESC",
        select_sql(backend, Entity::Session),
        column(backend, Entity::Session, "updatedAt")
    )
}

pub(crate) fn list_histories_sql(backend: BackendKind) -> String {
    format!(
        "{} WHERE {} = {} ORDER BY {} DESC",
        select_sql(backend, Entity::History),
        column(backend, Entity::History, "sessionId"),
        placeholder(backend, 1),
        column(backend, Entity::History, "timestamp")
    )
}

/// Null orders sort last; ties keep insertion order (`seq` on PostgreSQL,
/// `rowid` on SQLite).
pub(crate) fn list_proposals_sql(backend: BackendKind) -> String {
    let order = column(backend, Entity::Proposal, "selectedOrder");
    let insertion = match backend {
        BackendKind::Postgres => "\"seq\"",
        BackendKind::Sqlite => "rowid",
    };
    format!(
        "{} WHERE {} = {} ORDER BY {order} IS NULL, {order} ASC, {insertion} ASC",
        select_sql(backend, Entity::Proposal),
        column(backend, Entity::Proposal, "historyId"),
        placeholder(backend, 1)
    )
}

/// Bumps the correction counter and touches `updatedAt` of one session.
pub(crate) fn bump_session_sql(backend: BackendKind) -> String {
    let count = column(backend, Entity::Session, "correctionCount");
    format!(
        "UPDATE {} SET {count} = {count} + 1, {} = {} WHERE {} = {}",
        table(backend, Entity::Session),
        column(backend, Entity::Session, "updatedAt"),
        placeholder(backend, 1),
        column(backend, Entity::Session, "sessionId"),
        placeholder(backend, 2)
    )
}

pub(crate) fn update_session_sql(backend: BackendKind, assigned: &[&str]) -> String {
    let sets = assigned
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = {}", quote(col), placeholder(backend, i + 1)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {sets} WHERE {} = {}",
        table(backend, Entity::Session),
        column(backend, Entity::Session, "sessionId"),
        placeholder(backend, assigned.len() + 1)
    )
}

/// Cascade statements for one session, in dependency order. Each takes the
/// session id as its only parameter.
pub(crate) fn cascade_delete_sql(backend: BackendKind) -> [String; 3] {
    let p = placeholder(backend, 1);
    let history_session = column(backend, Entity::History, "sessionId");
    [
        format!(
            "DELETE FROM {} WHERE {} IN (SELECT {} FROM {} WHERE {history_session} = {p})",
            table(backend, Entity::Proposal),
            column(backend, Entity::Proposal, "historyId"),
            column(backend, Entity::History, "historyId"),
            table(backend, Entity::History),
        ),
        format!(
            "DELETE FROM {} WHERE {history_session} = {p}",
            table(backend, Entity::History)
        ),
        format!(
            "DELETE FROM {} WHERE {} = {p}",
            table(backend, Entity::Session),
            column(backend, Entity::Session, "sessionId")
        ),
    ]
}
