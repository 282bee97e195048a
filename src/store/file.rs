//! Directory-backed store.
//!
//! Layout per table:
//!
//! ```text
//! <root>/<table>/deltas.jsonl    append-only, one {"key","delta"} per line
//! <root>/<table>/inventory.json  shard inventory, replaced atomically
//! ```
//!
//! Rows are never rewritten; a row's value is the fold of its deltas.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::key::BucketKey;
use crate::reduce::Reducer;
use crate::store::{AggregateStore, InventoryEntry, ShardStatus, StoreResult};

const DELTA_LOG: &str = "deltas.jsonl";
const INVENTORY: &str = "inventory.json";

#[derive(Serialize)]
struct DeltaLine<'a, V> {
    key: &'a str,
    delta: &'a V,
}

#[derive(Deserialize)]
struct OwnedDeltaLine<V> {
    key: String,
    delta: V,
}

struct Handles {
    logs: HashMap<String, File>,
    inventories: HashMap<String, BTreeMap<String, InventoryEntry>>,
}

pub struct FileStore<R: Reducer> {
    root: PathBuf,
    reducer: R,
    handles: Mutex<Handles>,
}

impl<R: Reducer> FileStore<R> {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>, reducer: R) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            reducer,
            handles: Mutex::new(Handles {
                logs: HashMap::new(),
                inventories: HashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Handles>> {
        self.handles
            .lock()
            .map_err(|_| StoreError::Unavailable("file store lock poisoned".to_string()))
    }

    fn table_dir(&self, table: &str) -> StoreResult<PathBuf> {
        let valid = !table.is_empty()
            && table != "."
            && table != ".."
            && !table.contains(['/', '\\']);
        if !valid {
            return Err(StoreError::Unavailable(format!(
                "invalid table name '{table}'"
            )));
        }
        Ok(self.root.join(table))
    }

    /// Fold every logged delta of `table` into per-key totals.
    ///
    /// A final line without a newline is a write torn by a crash and is
    /// skipped.
    pub fn totals(&self, table: &str) -> StoreResult<BTreeMap<String, R::Value>> {
        let path = self.table_dir(table)?.join(DELTA_LOG);
        let mut totals = BTreeMap::new();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(totals),
            Err(err) => return Err(err.into()),
        };

        for line in contents.split_inclusive('\n') {
            if !line.ends_with('\n') {
                log::warn!(
                    "skipping torn delta line at end of {} ({} bytes)",
                    path.display(),
                    line.len()
                );
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            let parsed: OwnedDeltaLine<R::Value> = serde_json::from_str(line)?;
            let acc = totals
                .entry(parsed.key)
                .or_insert_with(|| self.reducer.identity());
            self.reducer.merge(acc, &parsed.delta);
        }
        Ok(totals)
    }

    /// Shard inventory of `table` as last written.
    pub fn inventory(&self, table: &str) -> StoreResult<Vec<InventoryEntry>> {
        let path = self.table_dir(table)?.join(INVENTORY);
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl<R: Reducer> AggregateStore<R::Value> for FileStore<R> {
    fn update(&self, table: &str, key: &BucketKey, delta: &R::Value) -> StoreResult<()> {
        let dir = self.table_dir(table)?;
        let mut line = serde_json::to_vec(&DeltaLine {
            key: key.as_str(),
            delta,
        })?;
        line.push(b'\n');

        let mut handles = self.lock()?;
        if !handles.logs.contains_key(table) {
            std::fs::create_dir_all(&dir)?;
            let file = open_log(&dir.join(DELTA_LOG))?;
            handles.logs.insert(table.to_string(), file);
        }
        let Some(file) = handles.logs.get_mut(table) else {
            return Ok(());
        };
        let before = file.metadata()?.len();
        if let Err(err) = file.write_all(&line) {
            // a partial line must not prefix the next append
            if let Err(trunc) = file.set_len(before) {
                log::warn!("failed to truncate delta log of {table} after a failed write: {trunc}");
            }
            handles.logs.remove(table);
            return Err(err.into());
        }
        Ok(())
    }

    fn set_shard_status(
        &self,
        table: &str,
        shard_id: &str,
        status: ShardStatus,
        at_ns: u64,
    ) -> StoreResult<()> {
        let dir = self.table_dir(table)?;
        std::fs::create_dir_all(&dir)?;

        let mut handles = self.lock()?;
        if !handles.inventories.contains_key(table) {
            let existing = self
                .inventory(table)?
                .into_iter()
                .map(|entry| (entry.shard_id.clone(), entry))
                .collect();
            handles.inventories.insert(table.to_string(), existing);
        }
        let inventory = handles.inventories.entry(table.to_string()).or_default();
        inventory.insert(
            shard_id.to_string(),
            InventoryEntry {
                shard_id: shard_id.to_string(),
                status,
                updated_ns: at_ns,
            },
        );
        let entries: Vec<&InventoryEntry> = inventory.values().collect();
        write_atomic(&dir.join(INVENTORY), &serde_json::to_vec_pretty(&entries)?)
    }

    fn sync(&self, table: &str) -> StoreResult<()> {
        let handles = self.lock()?;
        if let Some(file) = handles.logs.get(table) {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// Open a delta log for appending, cutting off a torn final line left by a
/// crash so new deltas start on a line of their own.
fn open_log(path: &Path) -> StoreResult<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let len = file.metadata()?.len();
    let keep = last_line_end(&mut file, len)?;
    if keep < len {
        log::warn!(
            "truncating torn delta line at end of {} ({} bytes)",
            path.display(),
            len - keep
        );
        file.set_len(keep)?;
    }
    Ok(file)
}

/// Offset just past the last newline in the first `len` bytes, or 0.
fn last_line_end(file: &mut File, len: u64) -> StoreResult<u64> {
    let mut buf = [0u8; 4096];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|byte| *byte == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
