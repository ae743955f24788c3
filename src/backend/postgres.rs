//! PostgreSQL backend over deadpool connection pools.
//!
//! A handle checks one connection out of the pool registered for its key
//! and drives the whole unit of work on it. The transaction opens lazily
//! (at `begin_transaction` for scopes with an explicit isolation level, at
//! the first write otherwise), commits on commit, and rolls back when an
//! uncommitted handle is disposed. Rows fetched through
//! [`PgHandle::fetch_entity`] are kept in an identity map so `reload` can
//! re-run the loading statement after a sibling scope commits.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use tokio::sync::Mutex;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;

use crate::backend::{
    BackendError, EntityId, IsolationLevel, ResourceFactory, ResourceHandle, ResourceKey,
};

fn begin_sql(level: IsolationLevel) -> &'static str {
    match level {
        IsolationLevel::ReadUncommitted => "BEGIN ISOLATION LEVEL READ UNCOMMITTED",
        IsolationLevel::ReadCommitted => "BEGIN ISOLATION LEVEL READ COMMITTED",
        IsolationLevel::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
        IsolationLevel::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
    }
}

fn disposed(key: &ResourceKey) -> BackendError {
    BackendError::msg(format!("postgres handle for `{key}` is disposed"))
}

/// Factory mapping resource keys to connection pools.
#[derive(Default)]
pub struct PgBackend {
    pools: HashMap<ResourceKey, Pool>,
}

impl PgBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the pool serving `key`.
    pub fn register(mut self, key: impl Into<ResourceKey>, pool: Pool) -> Self {
        self.pools.insert(key.into(), pool);
        self
    }
}

#[async_trait]
impl ResourceFactory for PgBackend {
    async fn create(&self, key: &ResourceKey) -> Result<Arc<dyn ResourceHandle>, BackendError> {
        let pool = self.pools.get(key).ok_or_else(|| {
            BackendError::msg(format!("no connection pool registered for resource key `{key}`"))
        })?;
        let conn = pool.get().await.map_err(BackendError::new)?;
        Ok(Arc::new(PgHandle {
            key: key.clone(),
            inner: Mutex::new(PgInner {
                conn: Some(conn),
                in_transaction: false,
                loads: HashMap::new(),
            }),
        }))
    }
}

struct CachedEntity {
    /// Loading statement with `$1` bound to the entity id.
    statement: String,
    row: Option<Arc<Row>>,
}

struct PgInner {
    conn: Option<Object>,
    in_transaction: bool,
    loads: HashMap<EntityId, CachedEntity>,
}

/// One pooled connection driving one unit of work.
pub struct PgHandle {
    key: ResourceKey,
    inner: Mutex<PgInner>,
}

impl PgHandle {
    /// Run `statement` with `$1` bound to `id` and cache the resulting row
    /// under `id`, so the refresh bridge can re-read it later.
    pub async fn fetch_entity(
        &self,
        id: EntityId,
        statement: &str,
    ) -> Result<Option<Arc<Row>>, BackendError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let conn = inner.conn.as_ref().ok_or_else(|| disposed(&self.key))?;

        let row = conn
            .query_opt(statement, &[&id.0])
            .await
            .map_err(BackendError::new)?
            .map(Arc::new);
        inner.loads.insert(
            id,
            CachedEntity {
                statement: statement.to_string(),
                row: row.clone(),
            },
        );
        Ok(row)
    }

    /// Latest cached row for `id`, if this handle loaded it.
    pub async fn cached_entity(&self, id: EntityId) -> Option<Arc<Row>> {
        self.inner.lock().await.loads.get(&id)?.row.clone()
    }

    /// Execute a statement on this unit of work's connection, opening the
    /// transaction on first write.
    pub async fn execute(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, BackendError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let conn = inner.conn.as_ref().ok_or_else(|| disposed(&self.key))?;

        if !inner.in_transaction {
            conn.batch_execute("BEGIN").await.map_err(BackendError::new)?;
            inner.in_transaction = true;
        }
        conn.execute(statement, params).await.map_err(BackendError::new)
    }
}

#[async_trait]
impl ResourceHandle for PgHandle {
    async fn begin_transaction(&self, level: IsolationLevel) -> Result<(), BackendError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let conn = inner.conn.as_ref().ok_or_else(|| disposed(&self.key))?;
        if inner.in_transaction {
            return Err(BackendError::msg("transaction already open"));
        }
        conn.batch_execute(begin_sql(level))
            .await
            .map_err(BackendError::new)?;
        inner.in_transaction = true;
        Ok(())
    }

    async fn commit(&self) -> Result<(), BackendError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let conn = inner.conn.as_ref().ok_or_else(|| disposed(&self.key))?;
        if inner.in_transaction {
            conn.batch_execute("COMMIT").await.map_err(BackendError::new)?;
            inner.in_transaction = false;
        }
        Ok(())
    }

    async fn reload(&self, id: EntityId) -> Result<bool, BackendError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(cached) = inner.loads.get(&id) else {
            return Ok(false);
        };
        let statement = cached.statement.clone();
        let conn = inner.conn.as_ref().ok_or_else(|| disposed(&self.key))?;

        let row = conn
            .query_opt(&statement, &[&id.0])
            .await
            .map_err(BackendError::new)?
            .map(Arc::new);
        inner.loads.insert(id, CachedEntity { statement, row });
        Ok(true)
    }

    fn dispose(&self) {
        // Sync context: hand the connection to a task that rolls back any
        // open transaction before the object returns to the pool.
        let Ok(mut guard) = self.inner.try_lock() else {
            tracing::warn!(key = %self.key, "handle disposed while in use; release deferred to drop");
            return;
        };
        let inner = &mut *guard;
        inner.loads.clear();
        let open = std::mem::replace(&mut inner.in_transaction, false);
        let Some(conn) = inner.conn.take() else {
            return;
        };
        if open {
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    let key = self.key.clone();
                    rt.spawn(async move {
                        if let Err(err) = conn.batch_execute("ROLLBACK").await {
                            tracing::warn!(%key, error = %err, "rollback on dispose failed");
                        }
                    });
                }
                Err(_) => {
                    tracing::warn!(
                        key = %self.key,
                        "disposed outside a runtime; connection dropped with an open transaction"
                    );
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
