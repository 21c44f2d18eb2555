use chaincache_core::schema::{
    BLOCK_TIMESTAMPS_TABLE, BLOCKS_TABLE, EVENT_QUERIES_TABLE, EVENTS_TABLE,
};
use chaincache_core::{EncodedEvent, EventQuery, SchemaVersion};
use eyre::{Result, WrapErr, bail, eyre};
use local_db::{BlockRecord, META_TABLE, Meta, SCHEMA_VERSIONS_TABLE};
use redb::{
    Builder, ReadOnlyDatabase, ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable,
    TableDefinition, TableHandle,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "db-cli")]
struct Options {
    #[structopt(long)]
    path: PathBuf,
    /// `meta`, `schema_versions` or a network table such as `1/blocks`
    #[structopt(long)]
    table: Option<String>,
    /// Block tables take a number, event tables `block,log_index`
    #[structopt(long)]
    key: Option<String>,
    #[structopt(long)]
    prefix: Option<String>,
    #[structopt(long)]
    limit: Option<usize>,
    #[structopt(long)]
    raw: bool,
    #[structopt(long)]
    copy: bool,
}

#[derive(Clone, Copy, Debug)]
enum TableKind {
    Meta,
    SchemaVersions,
    EventQueries,
    Events,
    Blocks,
    BlockTimestamps,
}

impl TableKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "meta" => return Some(Self::Meta),
            "schema_versions" => return Some(Self::SchemaVersions),
            _ => {}
        }
        let (network, table) = name.split_once('/')?;
        network.parse::<u64>().ok()?;
        match table {
            EVENT_QUERIES_TABLE => Some(Self::EventQueries),
            EVENTS_TABLE => Some(Self::Events),
            BLOCKS_TABLE => Some(Self::Blocks),
            BLOCK_TIMESTAMPS_TABLE => Some(Self::BlockTimestamps),
            _ => None,
        }
    }

    fn has_string_keys(self) -> bool {
        matches!(self, Self::Meta | Self::SchemaVersions | Self::EventQueries)
    }
}

#[derive(Serialize)]
struct Entry<K, T> {
    key: K,
    value: T,
}

#[derive(Serialize)]
struct RawEntry<K> {
    key: K,
    value_hex: String,
}

#[derive(Serialize)]
struct PairKey {
    first: u64,
    second: u64,
}

fn main() -> Result<()> {
    let opt = Options::from_args();

    if opt.key.is_some() && opt.table.is_none() {
        bail!("--key requires --table");
    }
    if opt.prefix.is_some() && opt.table.is_none() {
        bail!("--prefix requires --table");
    }
    if opt.limit.is_some() && opt.table.is_none() {
        bail!("--limit requires --table");
    }
    if opt.key.is_some() && opt.prefix.is_some() {
        bail!("--key and --prefix are mutually exclusive");
    }

    let db_path = resolve_db_path(&opt.path);
    if !db_path.exists() {
        bail!("db not found: {}", db_path.display());
    }

    let open_path = if opt.copy {
        let copy_path = copy_db_path(&db_path);
        std::fs::copy(&db_path, &copy_path).wrap_err("copy db for repair")?;
        let mut db = Builder::new()
            .open(&copy_path)
            .wrap_err("open redb copy for repair")?;
        db.check_integrity().wrap_err("repair redb copy")?;
        copy_path
    } else {
        db_path.clone()
    };

    let db = match ReadOnlyDatabase::open(&open_path) {
        Ok(db) => db,
        Err(err) => {
            if matches!(err, redb::DatabaseError::RepairAborted) && !opt.copy {
                return Err(eyre!(
                    "database needs repair; rerun with --copy to work on a safe copy"
                ));
            }
            return Err(err).wrap_err("open redb");
        }
    };
    let txn = db.begin_read().wrap_err("begin read")?;

    let Some(table_name) = opt.table.as_deref() else {
        return list_tables(&txn);
    };

    let table_kind =
        TableKind::from_name(table_name).ok_or_else(|| eyre!("unknown table: {table_name}"))?;
    if opt.prefix.is_some() && !table_kind.has_string_keys() {
        bail!("--prefix only applies to meta, schema_versions and event_queries tables");
    }
    let limit = opt.limit.unwrap_or(usize::MAX);

    match table_kind {
        TableKind::Meta | TableKind::SchemaVersions | TableKind::EventQueries => {
            let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table_name);
            let table = txn.open_table(definition)?;
            dump_string_table(table_kind, &table, &opt, limit)
        }
        TableKind::Events => {
            let definition: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new(table_name);
            let table = txn.open_table(definition)?;
            if let Some(key) = opt.key.as_deref() {
                let key = parse_pair_key(key)?;
                return match table.get(key)? {
                    Some(value) => print_value(table_kind, pair_key(key), value.value(), opt.raw),
                    None => bail!("key not found: {},{}", key.0, key.1),
                };
            }
            for entry in table.range::<(u64, u64)>(..)?.take(limit) {
                let (key, value) = entry?;
                print_value(table_kind, pair_key(key.value()), value.value(), opt.raw)?;
            }
            Ok(())
        }
        TableKind::Blocks => {
            let definition: TableDefinition<u64, &[u8]> = TableDefinition::new(table_name);
            let table = txn.open_table(definition)?;
            if let Some(key) = opt.key.as_deref() {
                let number: u64 = key.parse().wrap_err("parse block number")?;
                return match table.get(number)? {
                    Some(value) => print_value(table_kind, number, value.value(), opt.raw),
                    None => bail!("key not found: {number}"),
                };
            }
            for entry in table.range::<u64>(..)?.take(limit) {
                let (key, value) = entry?;
                print_value(table_kind, key.value(), value.value(), opt.raw)?;
            }
            Ok(())
        }
        TableKind::BlockTimestamps => {
            let definition: TableDefinition<(u64, u64), ()> = TableDefinition::new(table_name);
            let table = txn.open_table(definition)?;
            // Index rows carry no value; the key is (timestamp, block number).
            let keys: Vec<(u64, u64)> = if let Some(key) = opt.key.as_deref() {
                let key = parse_pair_key(key)?;
                if table.get(key)?.is_none() {
                    bail!("key not found: {},{}", key.0, key.1);
                }
                vec![key]
            } else {
                table
                    .range::<(u64, u64)>(..)?
                    .take(limit)
                    .map(|entry| entry.map(|(key, _)| key.value()))
                    .collect::<Result<_, _>>()?
            };
            for (timestamp, number) in keys {
                print_json(&Entry {
                    key: pair_key((timestamp, number)),
                    value: serde_json::json!({ "timestamp": timestamp, "block_number": number }),
                })?;
            }
            Ok(())
        }
    }
}

fn dump_string_table(
    table_kind: TableKind,
    table: &ReadOnlyTable<&'static str, &'static [u8]>,
    opt: &Options,
    limit: usize,
) -> Result<()> {
    if let Some(key) = opt.key.as_deref() {
        return match table.get(key)? {
            Some(value) => print_value(table_kind, key, value.value(), opt.raw),
            None => bail!("key not found: {key}"),
        };
    }

    let (_range_end, range) = if let Some(prefix) = opt.prefix.as_ref() {
        let end = format!("{prefix}~");
        let range = table.range(prefix.as_str()..end.as_str())?;
        (Some(end), range)
    } else {
        (None, table.range::<&str>(..)?)
    };

    for entry in range.take(limit) {
        let (key, value) = entry?;
        let key = key.value().to_string();
        print_value(table_kind, key.as_str(), value.value(), opt.raw)?;
    }
    Ok(())
}

fn resolve_db_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        local_db::db_path(path)
    } else {
        path.to_path_buf()
    }
}

fn copy_db_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|file| file.to_string_lossy().to_string())
        .filter(|file| !file.is_empty())
        .unwrap_or_else(|| "db.redb".to_string());
    path.with_file_name(format!("{name}.copy"))
}

fn list_tables(txn: &ReadTransaction) -> Result<()> {
    let mut names: Vec<String> = txn
        .list_tables()
        .wrap_err("list tables")?
        .map(|handle| handle.name().to_string())
        .collect();
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn parse_pair_key(key: &str) -> Result<(u64, u64)> {
    let (first, second) = key
        .split_once(',')
        .ok_or_else(|| eyre!("expected a key of the form a,b: {key}"))?;
    Ok((
        first.trim().parse().wrap_err("parse key")?,
        second.trim().parse().wrap_err("parse key")?,
    ))
}

fn pair_key((first, second): (u64, u64)) -> PairKey {
    PairKey { first, second }
}

fn print_value<K: Serialize>(table: TableKind, key: K, value: &[u8], raw: bool) -> Result<()> {
    if raw {
        let entry = RawEntry {
            key,
            value_hex: format!("0x{}", hex::encode(value)),
        };
        return print_json(&entry);
    }

    match table {
        TableKind::Meta => print_decoded::<_, Meta>(key, value),
        TableKind::SchemaVersions => print_decoded::<_, SchemaVersion>(key, value),
        TableKind::EventQueries => print_decoded::<_, EventQuery>(key, value),
        TableKind::Events => print_decoded::<_, EncodedEvent>(key, value),
        TableKind::Blocks => print_decoded::<_, BlockRecord>(key, value),
        TableKind::BlockTimestamps => bail!("block_timestamps rows have no value"),
    }
}

fn print_decoded<K, T>(key: K, value: &[u8]) -> Result<()>
where
    K: Serialize,
    T: DeserializeOwned + Serialize,
{
    let decoded: T = rmp_serde::from_slice(value).wrap_err("decode msgpack")?;
    print_json(&Entry {
        key,
        value: decoded,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let data = serde_json::to_string(value).wrap_err("serialize json")?;
    println!("{data}");
    Ok(())
}
