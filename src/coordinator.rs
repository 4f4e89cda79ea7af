use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    error::StoreError,
    models::{History, Proposal, Session, SessionPatch},
    schema_mapper::BackendKind,
    store::{PgStore, RecordStore, SqliteStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    Disabled,
    Enabled,
}

pub struct BackendCoordinator {
    primary: Arc<dyn RecordStore>,
    secondary: Option<Arc<dyn RecordStore>>,
    policy: FallbackPolicy,
}

impl BackendCoordinator {
    pub fn new(
        primary: Arc<dyn RecordStore>,
        secondary: Option<Arc<dyn RecordStore>>,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            primary,
            secondary,
            policy,
        }
    }

    pub fn single(store: Arc<dyn RecordStore>) -> Self {
        Self::new(store, None, FallbackPolicy::Disabled)
    }

    /// PostgreSQL is primary when enabled and a URL is configured; SQLite is
    /// opened only when it is the primary or an allowed fallback.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let open_sqlite = || -> Result<Arc<dyn RecordStore>> {
            let store = SqliteStore::open(&config.sqlite_path).with_context(|| {
                format!(
                    "Failed to open SQLite store at {}",
                    config.sqlite_path.display()
                )
            })?;
            Ok(Arc::new(store))
        };

        let database_url = match (&config.database_url, config.use_postgres) {
            (Some(url), true) => url,
            (None, true) => {
                warn!("USE_POSTGRESQL is set but DATABASE_URL is missing; using SQLite only");
                return Ok(Self::single(open_sqlite()?));
            }
            (_, false) => {
                info!("PostgreSQL disabled; using SQLite only");
                return Ok(Self::single(open_sqlite()?));
            }
        };

        let pg = PgStore::connect_lazy(database_url, config.pg_max_connections)
            .context("Invalid DATABASE_URL")?;
        if let Err(err) = pg.bootstrap().await {
            error!(error = %err, "PostgreSQL schema bootstrap failed");
        }

        if config.allow_fallback {
            info!("PostgreSQL primary with SQLite fallback");
            Ok(Self::new(
                Arc::new(pg),
                Some(open_sqlite()?),
                FallbackPolicy::Enabled,
            ))
        } else {
            info!("PostgreSQL primary, fallback disabled");
            Ok(Self::single(Arc::new(pg)))
        }
    }

    pub fn primary_backend(&self) -> BackendKind {
        self.primary.backend()
    }

    pub fn secondary_backend(&self) -> Option<BackendKind> {
        self.secondary.as_ref().map(|store| store.backend())
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    fn fallback_target(&self) -> Option<&Arc<dyn RecordStore>> {
        match self.policy {
            FallbackPolicy::Enabled => self.secondary.as_ref(),
            FallbackPolicy::Disabled => None,
        }
    }

    async fn route<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<dyn RecordStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let err = match call(self.primary.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        let Some(secondary) = self.fallback_target() else {
            error!(
                operation,
                backend = %self.primary.backend(),
                error = %err,
                "Primary backend failed"
            );
            return Err(err);
        };

        warn!(
            operation,
            primary = %self.primary.backend(),
            secondary = %secondary.backend(),
            error = %err,
            "Primary backend failed, falling back"
        );
        call(secondary.clone()).await
    }
}

#[async_trait]
impl RecordStore for BackendCoordinator {
    fn backend(&self) -> BackendKind {
        self.primary.backend()
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.route("list_sessions", |store| async move {
            store.list_sessions().await
        })
        .await
    }

    async fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        self.route("create_session", |store| {
            let session = session.clone();
            async move { store.create_session(session).await }
        })
        .await
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.route("fetch_session", |store| async move {
            store.fetch_session(session_id).await
        })
        .await
    }

    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        self.route("update_session", |store| {
            let patch = patch.clone();
            async move { store.update_session(session_id, patch).await }
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.route("delete_session", |store| async move {
            store.delete_session(session_id).await
        })
        .await
    }

    async fn list_histories(&self, session_id: &str) -> Result<Vec<History>, StoreError> {
        self.route("list_histories", |store| async move {
            store.list_histories(session_id).await
        })
        .await
    }

    async fn create_history(&self, history: History) -> Result<History, StoreError> {
        self.route("create_history", |store| {
            let history = history.clone();
            async move { store.create_history(history).await }
        })
        .await
    }

    async fn list_proposals(&self, history_id: &str) -> Result<Vec<Proposal>, StoreError> {
        self.route("list_proposals", |store| async move {
            store.list_proposals(history_id).await
        })
        .await
    }

    async fn create_proposal(&self, proposal: Proposal) -> Result<Proposal, StoreError> {
        self.route("create_proposal", |store| {
            let proposal = proposal.clone();
            async move { store.create_proposal(proposal).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fails every call with the configured error and counts attempts.
    struct FailingStore {
        backend: BackendKind,
        validation: bool,
        calls: AtomicUsize,
    }

    impl FailingStore {
        fn unavailable() -> Self {
            Self {
                backend: BackendKind::Postgres,
                validation: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn rejecting() -> Self {
            Self {
                validation: true,
                ..Self::unavailable()
            }
        }

        fn fail<T>(&self) -> Result<T, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.validation {
                Err(StoreError::validation("rejected by primary"))
            } else {
                Err(StoreError::unavailable(self.backend, "connection refused"))
            }
        }
    }

    #[async_trait]
    impl RecordStore for FailingStore {
        fn backend(&self) -> BackendKind {
            self.backend
        }
        async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
            self.fail()
        }
        async fn create_session(&self, _: Session) -> Result<Session, StoreError> {
            self.fail()
        }
        async fn fetch_session(&self, _: &str) -> Result<Option<Session>, StoreError> {
            self.fail()
        }
        async fn update_session(
            &self,
            _: &str,
            _: SessionPatch,
        ) -> Result<Option<Session>, StoreError> {
            self.fail()
        }
        async fn delete_session(&self, _: &str) -> Result<(), StoreError> {
            self.fail()
        }
        async fn list_histories(&self, _: &str) -> Result<Vec<History>, StoreError> {
            self.fail()
        }
        async fn create_history(&self, _: History) -> Result<History, StoreError> {
            self.fail()
        }
        async fn list_proposals(&self, _: &str) -> Result<Vec<Proposal>, StoreError> {
            self.fail()
        }
        async fn create_proposal(&self, _: Proposal) -> Result<Proposal, StoreError> {
            self.fail()
        }
    }

    #[tokio::test]
    async fn disabled_fallback_propagates_primary_error() {
        let primary = Arc::new(FailingStore::unavailable());
        let secondary = Arc::new(SqliteStore::open_in_memory().unwrap());
        let coordinator = BackendCoordinator::new(
            primary.clone(),
            Some(secondary.clone()),
            FallbackPolicy::Disabled,
        );

        let err = coordinator
            .create_session(Session::new(None))
            .await
            .unwrap_err();
        match err {
            StoreError::BackendUnavailable { backend, message } => {
                assert_eq!(backend, BackendKind::Postgres);
                assert_eq!(message, "connection refused");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert!(secondary.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enabled_fallback_returns_secondary_result() {
        let primary = Arc::new(FailingStore::unavailable());
        let secondary = Arc::new(SqliteStore::open_in_memory().unwrap());
        let coordinator = BackendCoordinator::new(
            primary.clone(),
            Some(secondary.clone()),
            FallbackPolicy::Enabled,
        );

        let created = coordinator
            .create_session(Session::new(Some("fallback".into())))
            .await
            .unwrap();
        let fetched = coordinator.fetch_session(&created.session_id).await.unwrap();
        assert_eq!(fetched, Some(created.clone()));
        assert_eq!(secondary.list_sessions().await.unwrap(), vec![created]);

        // Every call re-tries the primary first.
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let primary = Arc::new(FailingStore::rejecting());
        let secondary = Arc::new(SqliteStore::open_in_memory().unwrap());
        let coordinator = BackendCoordinator::new(
            primary.clone(),
            Some(secondary.clone()),
            FallbackPolicy::Enabled,
        );

        let err = coordinator.list_sessions().await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(secondary.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enabled_policy_without_secondary_propagates() {
        let coordinator = BackendCoordinator::new(
            Arc::new(FailingStore::unavailable()),
            None,
            FallbackPolicy::Enabled,
        );
        assert!(coordinator.delete_session("s1").await.unwrap_err().is_retryable());
        assert_eq!(coordinator.secondary_backend(), None);
    }

    #[tokio::test]
    async fn sqlite_only_config_builds_single_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            use_postgres: false,
            sqlite_path: dir.path().join("app.db"),
            ..Config::default()
        };
        let coordinator = BackendCoordinator::from_config(&config).await.unwrap();
        assert_eq!(coordinator.primary_backend(), BackendKind::Sqlite);
        assert_eq!(coordinator.secondary_backend(), None);
        assert_eq!(coordinator.policy(), FallbackPolicy::Disabled);
    }
}
