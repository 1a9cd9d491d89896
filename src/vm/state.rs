//! Persisted identity and resource state for a data directory.
//!
//! State lives in a single versioned JSON record that is replaced atomically
//! (write to a sibling temp file, then rename). Bundles written by older
//! builds kept one value per file (`cpu`, `mem`, `id`); those are read once
//! as a fallback when no record exists yet.
//!
//! Absent, truncated or unparsable data always reads back as "unset".

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::vm::data_dir::{DataDir, ensure_parent};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Reader/writer for the state record of one bundle.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    legacy_cpu: PathBuf,
    legacy_memory: PathBuf,
    legacy_id: PathBuf,
}

impl StateStore {
    pub fn new(dir: &DataDir) -> Self {
        Self {
            path: dir.state(),
            legacy_cpu: dir.legacy_cpu(),
            legacy_memory: dir.legacy_memory(),
            legacy_id: dir.legacy_id(),
        }
    }

    /// Load the current record. Never fails: unreadable state is unset.
    pub fn load(&self) -> StateRecord {
        match std::fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<StateRecord>(&bytes) {
                Ok(record) if record.version <= STATE_VERSION => record,
                Ok(record) => {
                    warn!(
                        path = %self.path.display(),
                        version = record.version,
                        "state record is from a newer version, ignoring"
                    );
                    StateRecord::default()
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "unreadable state record, treating as unset");
                    StateRecord::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.load_legacy(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read state record");
                StateRecord::default()
            }
        }
    }

    pub fn cpus(&self) -> Option<u32> {
        self.load().cpus
    }

    pub fn memory(&self) -> Option<u64> {
        self.load().memory
    }

    pub fn machine_id(&self) -> Option<Vec<u8>> {
        self.load().machine_id.filter(|id| !id.is_empty())
    }

    pub fn save_cpus(&self, cpus: u32) -> io::Result<()> {
        self.update(|r| r.cpus = Some(cpus))
    }

    pub fn save_memory(&self, memory: u64) -> io::Result<()> {
        self.update(|r| r.memory = Some(memory))
    }

    pub fn save_machine_id(&self, id: &[u8]) -> io::Result<()> {
        self.update(|r| r.machine_id = Some(id.to_vec()))
    }

    /// Read-modify-write the record and replace it atomically.
    ///
    /// A record from a newer build is moved to `state.json.v<N>` first so
    /// its contents survive.
    pub fn update(&self, f: impl FnOnce(&mut StateRecord)) -> io::Result<()> {
        self.set_aside_newer_record()?;
        let mut record = self.load();
        f(&mut record);
        record.version = STATE_VERSION;
        record.updated_at = Some(Utc::now());
        self.write(&record)
    }

    fn write(&self, record: &StateRecord) -> io::Result<()> {
        ensure_parent(&self.path)?;
        let json = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;

        let tmp = temp_sibling(&self.path);
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.write_all(b"\n")?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "saved state record");
        Ok(())
    }

    fn set_aside_newer_record(&self) -> io::Result<()> {
        #[derive(Deserialize)]
        struct VersionOnly {
            version: u32,
        }

        let Ok(bytes) = std::fs::read(&self.path) else {
            return Ok(());
        };
        let Ok(VersionOnly { version }) = serde_json::from_slice(&bytes) else {
            return Ok(());
        };
        if version <= STATE_VERSION {
            return Ok(());
        }

        let backup = versioned_sibling(&self.path, version);
        std::fs::rename(&self.path, &backup)?;
        warn!(
            path = %self.path.display(),
            backup = %backup.display(),
            version,
            "moved state record from a newer version aside"
        );
        Ok(())
    }

    fn load_legacy(&self) -> StateRecord {
        let cpus = read_scalar(&self.legacy_cpu).and_then(|s| s.parse().ok());
        let memory = read_scalar(&self.legacy_memory).and_then(|s| s.parse().ok());
        let machine_id = read_scalar(&self.legacy_id).and_then(|s| parse_byte_list(&s));

        if cpus.is_some() || memory.is_some() || machine_id.is_some() {
            debug!("loaded legacy per-value state files");
        }
        StateRecord {
            version: STATE_VERSION,
            machine_id,
            cpus,
            memory,
            updated_at: None,
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn versioned_sibling(path: &Path, version: u32) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".v{version}"));
    path.with_file_name(name)
}

/// Trimmed contents of a legacy scalar file; empty counts as missing.
fn read_scalar(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    if text.is_empty() { None } else { Some(text.to_string()) }
}

/// Parse a `[1 2 3]` byte list. Anything malformed is unset.
fn parse_byte_list(s: &str) -> Option<Vec<u8>> {
    let inner = s.strip_prefix('[')?.strip_suffix(']')?;
    let bytes = inner
        .split_whitespace()
        .map(|b| b.parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    if bytes.is_empty() { None } else { Some(bytes) }
}
