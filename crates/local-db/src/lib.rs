mod backend;
mod store;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::B256;
use chaincache_core::BlockRef;
use redb::{Database, ReadableDatabase, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use backend::DbBackend;
pub use store::{DbReadScope, DbWriteScope};

pub const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
pub const SCHEMA_VERSIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("schema_versions");

pub const META_KEY: &str = "meta";
const CACHE_DIR: &str = "chaincache";
const DB_FILE: &str = "db.redb";

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub root_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("db"),
        }
    }
}

#[derive(Debug)]
pub struct DbStore {
    root_dir: PathBuf,
    db: Database,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("db error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unsupported schema version {version}")]
    UnsupportedSchemaVersion { version: u32 },
    #[error("unsupported db backend {0:?}")]
    UnsupportedBackend(String),
    #[error("unknown table {0}")]
    UnknownTable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub schema_version: u32,
    pub app_version: String,
    pub created_at: u64,
}

impl Meta {
    fn current(created_at: u64) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at,
        }
    }
}

/// State of a database file judged by its `meta` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    Fresh,
    Current,
    Migrate { from: u32, created_at: u64 },
    Unsupported { version: u32 },
}

impl Layout {
    pub(crate) fn of(meta: Option<&Meta>) -> Self {
        match meta {
            None => Self::Fresh,
            Some(meta) if meta.schema_version == CURRENT_SCHEMA_VERSION => Self::Current,
            Some(meta) if meta.schema_version < CURRENT_SCHEMA_VERSION => Self::Migrate {
                from: meta.schema_version,
                created_at: meta.created_at,
            },
            Some(meta) => Self::Unsupported {
                version: meta.schema_version,
            },
        }
    }
}

/// Value stored in a network's `blocks` table, keyed by block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub timestamp: u64,
    pub hash: B256,
}

impl BlockRecord {
    #[must_use]
    pub fn into_block_ref(self, number: u64) -> BlockRef {
        BlockRef {
            number,
            timestamp: self.timestamp,
            hash: self.hash,
        }
    }
}

impl From<&BlockRef> for BlockRecord {
    fn from(block: &BlockRef) -> Self {
        Self {
            timestamp: block.timestamp,
            hash: block.hash,
        }
    }
}

impl DbStore {
    /// Opens or creates the database under `config.root_dir`. A file written
    /// by a newer or unmigratable layout is renamed aside and replaced.
    pub fn open(config: DbConfig) -> Result<Self, DbError> {
        let root_dir = config.root_dir;
        std::fs::create_dir_all(cache_dir(&root_dir))?;
        let path = db_path(&root_dir);

        loop {
            let store = Self {
                db: Database::create(&path)?,
                root_dir: root_dir.clone(),
            };
            store.initialize_schema()?;

            let meta = store.read_meta()?;
            let created_at = match Layout::of(meta.as_ref()) {
                Layout::Current => return Ok(store),
                Layout::Fresh => now_epoch_secs()?,
                Layout::Migrate { from, created_at } => match store.run_migrations(from) {
                    Ok(()) => created_at,
                    Err(DbError::UnsupportedSchemaVersion { .. }) => {
                        drop(store);
                        backup_db(&path)?;
                        continue;
                    }
                    Err(err) => return Err(err),
                },
                Layout::Unsupported { version } => {
                    debug!(version, "database layout is newer than this build");
                    drop(store);
                    backup_db(&path)?;
                    continue;
                }
            };
            store.write_meta(&Meta::current(created_at))?;
            return Ok(store);
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn db_path(&self) -> PathBuf {
        db_path(&self.root_dir)
    }

    pub fn meta(&self) -> Result<Option<Meta>, DbError> {
        self.read_meta()
    }

    fn initialize_schema(&self) -> Result<(), DbError> {
        let txn = self.db.begin_write()?;
        txn.open_table(META_TABLE)?;
        txn.open_table(SCHEMA_VERSIONS_TABLE)?;
        txn.commit()?;
        Ok(())
    }

    fn read_meta(&self) -> Result<Option<Meta>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        match table.get(META_KEY)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn write_meta(&self, meta: &Meta) -> Result<(), DbError> {
        let data = encode(meta)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META_TABLE)?;
            table.insert(META_KEY, data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Upgrades `from` to the current layout in place. Version 0 predates the
    /// `schema_versions` table, which `initialize_schema` already created.
    fn run_migrations(&self, from: u32) -> Result<(), DbError> {
        for version in from..CURRENT_SCHEMA_VERSION {
            if version != 0 {
                return Err(DbError::UnsupportedSchemaVersion { version });
            }
        }
        Ok(())
    }
}

fn cache_dir(root_dir: &Path) -> PathBuf {
    root_dir.join(CACHE_DIR)
}

/// Location of the database file under `root_dir`.
#[must_use]
pub fn db_path(root_dir: &Path) -> PathBuf {
    cache_dir(root_dir).join(DB_FILE)
}

fn backup_db(db_path: &Path) -> Result<(), DbError> {
    let ts = now_epoch_secs()?;
    let file_name = format!("{DB_FILE}.bak.{ts}");
    let backup_path = db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(file_name);
    warn!(
        db = %db_path.display(),
        backup = %backup_path.display(),
        "unsupported database layout, moving it aside"
    );
    std::fs::rename(db_path, backup_path)?;
    Ok(())
}

pub(crate) fn now_epoch_secs() -> Result<u64, DbError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(std::io::Error::other)?;
    Ok(now.as_secs())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DbError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, DbError> {
    Ok(rmp_serde::from_slice(data)?)
}
