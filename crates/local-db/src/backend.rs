use std::fmt;
use std::str::FromStr;

use redb::{ReadOnlyDatabase, ReadableDatabase, TableError};
use serde::{Deserialize, Serialize};

use crate::{DbConfig, DbError, Layout, META_KEY, META_TABLE, Meta, decode, db_path};

/// Storage engines the cache can run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
    #[default]
    Redb,
}

impl DbBackend {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Redb => "redb",
        }
    }

    /// Verifies that an existing database under `config` can be read by this
    /// backend without modifying it. A missing database is fine and yields `None`;
    /// a layout newer than this build is `UnsupportedSchemaVersion`.
    pub fn check_supported(self, config: &DbConfig) -> Result<Option<Meta>, DbError> {
        let path = db_path(&config.root_dir);
        if !path.exists() {
            return Ok(None);
        }
        match self {
            Self::Redb => {
                let db = ReadOnlyDatabase::open(&path)?;
                let txn = db.begin_read()?;
                let table = match txn.open_table(META_TABLE) {
                    Ok(table) => table,
                    Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                let meta: Option<Meta> = match table.get(META_KEY)? {
                    Some(value) => Some(decode(value.value())?),
                    None => None,
                };
                if let Layout::Unsupported { version } = Layout::of(meta.as_ref()) {
                    return Err(DbError::UnsupportedSchemaVersion { version });
                }
                Ok(meta)
            }
        }
    }
}

impl fmt::Display for DbBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbBackend {
    type Err = DbError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            other => Err(DbError::UnsupportedBackend(other.to_string())),
        }
    }
}
