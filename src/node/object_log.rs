use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Error, Result};
use log::debug;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Split};
use tokio::sync::Mutex;

/// Separates client id and object id in a log entry
const SEPARATOR: &str = "::";

/// An object stored on behalf of a client
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub client_id: u64,
    pub object_id: u64,
}

impl fmt::Display for ObjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.client_id, SEPARATOR, self.object_id)
    }
}

impl FromStr for ObjectRecord {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (client_id, object_id) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| anyhow!("missing {:?}", SEPARATOR))?;
        Ok(ObjectRecord {
            client_id: client_id.trim().parse()?,
            object_id: object_id.trim().parse()?,
        })
    }
}

/// Append-only, newline-delimited file of `clientID::objectID` entries
///
/// Entries are never removed or rewritten. Lookups scan the whole file.
/// Appends and scans are serialized, so a scan never observes a partially written entry.
pub struct ObjectLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ObjectLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ObjectLog {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: ObjectRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open object log {}", self.path.display()))?;
        file.write_all(format!("{}\n", record).as_bytes())
            .await
            .with_context(|| format!("Failed to write to object log {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    pub async fn contains(&self, record: ObjectRecord) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let Some(mut lines) = self.open_lines().await? else {
            return Ok(false);
        };
        while let Some(entry) = self.next_entry(&mut lines).await? {
            if entry == record {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// All well-formed entries, in the order they were appended
    pub async fn records(&self) -> Result<Vec<ObjectRecord>> {
        let _guard = self.lock.lock().await;
        let mut records = Vec::new();
        if let Some(mut lines) = self.open_lines().await? {
            while let Some(entry) = self.next_entry(&mut lines).await? {
                records.push(entry);
            }
        }
        Ok(records)
    }

    /// A log that has never been written to does not exist yet
    async fn open_lines(&self) -> Result<Option<Split<BufReader<File>>>> {
        match File::open(&self.path).await {
            Ok(file) => Ok(Some(BufReader::new(file).split(b'\n'))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to open object log {}", self.path.display())),
        }
    }

    /// Next well-formed entry, lines that are not valid UTF-8 or not an entry are skipped
    async fn next_entry(&self, lines: &mut Split<BufReader<File>>) -> Result<Option<ObjectRecord>> {
        while let Some(line) = lines
            .next_segment()
            .await
            .with_context(|| format!("Failed to read object log {}", self.path.display()))?
        {
            let line = match std::str::from_utf8(&line) {
                Ok(line) => line.trim_end_matches('\r'),
                Err(e) => {
                    debug!("Skipping non-UTF-8 line in {}: {}", self.path.display(), e);
                    continue;
                }
            };
            match line.parse::<ObjectRecord>() {
                Ok(entry) => return Ok(Some(entry)),
                Err(e) => debug!(
                    "Skipping malformed entry {:?} in {}: {}",
                    line,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(None)
    }
}
