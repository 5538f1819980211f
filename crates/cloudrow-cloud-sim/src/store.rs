//! Declared-state table store
//!
//! One table per resource kind, rows keyed by row id and stored as JSON
//! objects. Persisted to `.cloudrow/state.json` (with a backup of the
//! previous version) or kept in memory. Every write goes through
//! [`TableStore::transact`], which applies a change to a copy and commits
//! it only after it has been saved.

use crate::error::{Result, SimError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudrow_engine::{Backend, Context, Entity, IdentityCodec, RowId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

const STORE_VERSION: u32 = 1;
const STORE_DIR: &str = ".cloudrow";
const STORE_FILE: &str = "state.json";
const STORE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";

/// Row data, column name to value
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Every table of one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tables {
    /// Store file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Last row id handed out, shared by every table
    pub last_row: RowId,

    pub tables: BTreeMap<String, BTreeMap<RowId, Row>>,

    /// Installed modules; absent until the account installs or uninstalls one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<BTreeSet<String>>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            last_row: 0,
            tables: BTreeMap::new(),
            modules: None,
        }
    }
}

impl Tables {
    pub fn rows(&self, table: &str) -> impl Iterator<Item = (RowId, &Row)> {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(id, row)| (*id, row)))
    }

    pub fn insert(&mut self, table: &str, row: Row) -> RowId {
        self.last_row += 1;
        let id = self.last_row;
        self.tables.entry(table.to_string()).or_default().insert(id, row);
        self.updated_at = Utc::now();
        id
    }

    /// Overwrite the columns present in `row`, keeping any others.
    pub fn update(&mut self, table: &str, id: RowId, row: Row) -> Result<()> {
        let existing = self
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| SimError::Store(format!("{} row {} does not exist", table, id)))?;
        existing.extend(row);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn remove(&mut self, table: &str, id: RowId) -> Option<Row> {
        let removed = self.tables.get_mut(table).and_then(|rows| rows.remove(&id));
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Record `module` as installed. `all` is the installed set to start
    /// from when none has been recorded yet.
    pub fn install(&mut self, all: &BTreeSet<String>, module: &str) {
        self.modules
            .get_or_insert_with(|| all.clone())
            .insert(module.to_string());
        self.updated_at = Utc::now();
    }

    /// Record `module` as uninstalled and drop its tables
    pub fn uninstall<'a>(
        &mut self,
        all: &BTreeSet<String>,
        module: &str,
        tables: impl IntoIterator<Item = &'a str>,
    ) {
        self.modules
            .get_or_insert_with(|| all.clone())
            .remove(module);
        for table in tables {
            self.tables.remove(table);
        }
        self.updated_at = Utc::now();
    }
}

/// Declared-state tables for one account
pub struct TableStore {
    /// Project root; `None` keeps everything in memory
    project_root: Option<PathBuf>,
    tables: Mutex<Tables>,
}

impl TableStore {
    pub fn in_memory() -> Self {
        Self {
            project_root: None,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Open the store under `project_root`, loading existing tables.
    pub async fn open(project_root: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            project_root: Some(project_root.as_ref().to_path_buf()),
            tables: Mutex::new(Tables::default()),
        };
        let loaded = store.load().await?;
        *store.tables.lock().await = loaded;
        Ok(store)
    }

    fn store_dir(&self) -> Option<PathBuf> {
        self.project_root.as_ref().map(|root| root.join(STORE_DIR))
    }

    /// Ensure the store directory exists
    async fn ensure_store_dir(&self) -> Result<Option<PathBuf>> {
        let Some(dir) = self.store_dir() else {
            return Ok(None);
        };
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created store directory: {}", dir.display());
        }
        Ok(Some(dir))
    }

    async fn load(&self) -> Result<Tables> {
        let Some(path) = self.store_dir().map(|dir| dir.join(STORE_FILE)) else {
            return Ok(Tables::default());
        };
        if !path.exists() {
            tracing::debug!("Store file not found, starting with empty tables");
            return Ok(Tables::default());
        }

        let content = fs::read_to_string(&path).await?;
        let tables: Tables = serde_json::from_str(&content)?;

        if tables.version > STORE_VERSION {
            return Err(SimError::Store(format!(
                "Store file version {} is newer than supported version {}",
                tables.version, STORE_VERSION
            )));
        }

        tracing::debug!("Loaded {} tables", tables.tables.len());
        Ok(tables)
    }

    async fn save(&self, tables: &Tables) -> Result<()> {
        let Some(dir) = self.ensure_store_dir().await? else {
            return Ok(());
        };
        let path = dir.join(STORE_FILE);
        let backup = dir.join(STORE_BACKUP);

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
        }

        let content = serde_json::to_string_pretty(tables)?;
        fs::write(&path, content).await?;

        tracing::debug!("Saved {} tables", tables.tables.len());
        Ok(())
    }

    /// Apply `f` to a copy of the tables, save it, then make it current.
    /// Nothing changes when `f` or the save fails.
    pub async fn transact<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut current = self.tables.lock().await;
        let mut next = current.clone();
        let out = f(&mut next)?;
        self.save(&next).await?;
        *current = next;
        Ok(out)
    }

    pub async fn snapshot(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    /// Typed rows of one table
    pub async fn rows<E: DeserializeOwned>(&self, table: &str) -> Result<Vec<(RowId, E)>> {
        let tables = self.tables.lock().await;
        tables
            .rows(table)
            .map(|(id, row)| -> Result<(RowId, E)> {
                let value = serde_json::Value::Object(row.clone());
                Ok((id, serde_json::from_value(value)?))
            })
            .collect()
    }

    /// Insert one typed row, returning its row id
    pub async fn insert<E: Serialize>(&self, table: &str, value: &E) -> Result<RowId> {
        let row = to_row(table, value)?;
        self.transact(|tables| Ok(tables.insert(table, row))).await
    }

    pub async fn remove(&self, table: &str, id: RowId) -> Result<bool> {
        self.transact(|tables| Ok(tables.remove(table, id).is_some()))
            .await
    }

    /// Acquire the store's file lock for exclusive access across processes.
    pub async fn acquire_lock(&self) -> Result<StoreLock> {
        let Some(dir) = self.ensure_store_dir().await? else {
            return Ok(StoreLock {
                lock_path: None,
                released: false,
            });
        };
        let lock_path = dir.join(LOCK_FILE);

        if lock_path.exists() {
            let content = fs::read_to_string(&lock_path).await?;
            let lock_info: LockInfo = serde_json::from_str(&content)?;

            // Locks older than an hour are considered abandoned
            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < 1 {
                return Err(SimError::Locked {
                    holder: lock_info.holder,
                    since: lock_info.acquired_at.to_rfc3339(),
                });
            }

            tracing::warn!("Removing stale lock from {}", lock_info.holder);
        }

        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        };

        let content = serde_json::to_string_pretty(&lock_info)?;
        fs::write(&lock_path, content).await?;

        tracing::debug!("Acquired store lock");
        Ok(StoreLock {
            lock_path: Some(lock_path),
            released: false,
        })
    }
}

impl std::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore")
            .field("project_root", &self.project_root)
            .finish()
    }
}

fn to_row<E: Serialize>(table: &str, value: &E) -> Result<Row> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(row) => Ok(row),
        other => Err(SimError::Store(format!(
            "{} rows must be objects, got {}",
            table, other
        ))),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for the store lock
#[derive(Debug)]
pub struct StoreLock {
    lock_path: Option<PathBuf>,
    released: bool,
}

impl StoreLock {
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if let Some(path) = self.lock_path.as_ref().filter(|p| p.exists()) {
                fs::remove_file(path).await?;
                tracing::debug!("Released store lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(path) = self.lock_path.as_ref().filter(|p| p.exists()) {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Entities the store keeps per region
pub trait Regional {
    fn region(&self) -> &str;
}

/// Declared-state backend for one kind, backed by its table.
///
/// Rows in regions that are not enabled for the run are invisible, so a
/// disabled region is never reconciled.
pub struct TableBackend<E> {
    store: Arc<TableStore>,
    codec: IdentityCodec,
    _entity: PhantomData<fn() -> E>,
}

impl<E> TableBackend<E> {
    pub fn new(store: Arc<TableStore>, codec: IdentityCodec) -> Self {
        Self {
            store,
            codec,
            _entity: PhantomData,
        }
    }

    fn table(&self) -> &'static str {
        self.codec.kind()
    }
}

impl<E> Clone for TableBackend<E> {
    fn clone(&self) -> Self {
        Self::new(self.store.clone(), self.codec)
    }
}

#[async_trait]
impl<E> Backend<E> for TableBackend<E>
where
    E: Entity + Regional + Serialize + DeserializeOwned,
{
    async fn create(&self, _ctx: &Context, entities: Vec<E>) -> cloudrow_engine::Result<Vec<E>> {
        let table = self.table();
        let rows = entities
            .iter()
            .map(|e| to_row(table, e))
            .collect::<Result<Vec<_>>>()?;
        let ids = self
            .store
            .transact(|tables| Ok(rows.into_iter().map(|row| tables.insert(table, row)).collect::<Vec<_>>()))
            .await?;

        Ok(entities
            .into_iter()
            .zip(ids)
            .map(|(mut e, id)| {
                e.set_row_id(Some(id));
                e
            })
            .collect())
    }

    async fn read(&self, ctx: &Context, id: Option<&str>) -> cloudrow_engine::Result<Vec<E>> {
        let mut out = Vec::new();
        for (row, mut entity) in self.store.rows::<E>(self.table()).await? {
            if !ctx.is_enabled(entity.region()) {
                continue;
            }
            entity.set_row_id(Some(row));
            if let Some(id) = id {
                if self.codec.entity_id(&entity)? != id {
                    continue;
                }
            }
            out.push(entity);
        }
        Ok(out)
    }

    async fn update(&self, _ctx: &Context, entities: Vec<E>) -> cloudrow_engine::Result<Vec<E>> {
        let table = self.table();
        let mut rows = Vec::with_capacity(entities.len());
        for e in &entities {
            let id = e.row_id().ok_or_else(|| {
                SimError::Store(format!("cannot update a {} without a row id", table))
            })?;
            rows.push((id, to_row(table, e)?));
        }
        self.store
            .transact(|tables| {
                rows.into_iter()
                    .try_for_each(|(id, row)| tables.update(table, id, row))
            })
            .await?;
        Ok(entities)
    }

    async fn delete(&self, _ctx: &Context, entities: Vec<E>) -> cloudrow_engine::Result<()> {
        let table = self.table();
        let ids: Vec<RowId> = entities.iter().filter_map(Entity::row_id).collect();
        self.store
            .transact(|tables| {
                for id in ids {
                    tables.remove(table, id);
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}
