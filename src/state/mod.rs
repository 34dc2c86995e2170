//! Per-container working directory.
//!
//! Setup and teardown run in separate processes, so everything teardown needs
//! is written here during setup. The directory is
//! `<state_dir>/<first 8 chars of the container id>` and holds:
//!
//! - `record.json`: the versioned [`EniRecord`], the only file teardown reads
//! - `create.json`, `attach.json`, `detach.json`, `delete.json`: raw provider
//!   responses kept for diagnostics

use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{EniError, Result};

/// Current `record.json` schema version
pub const RECORD_VERSION: u32 = 1;

const RECORD_FILE: &str = "record.json";
const LOCK_FILE: &str = "device-index.lock";
const PREFIX_LEN: usize = 8;

/// Everything teardown needs to release an ENI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EniRecord {
    pub version: u32,
    pub container_id: String,
    pub region: String,
    pub interface_id: String,
    pub mac_address: String,
    pub private_ip: Option<String>,
    pub attachment_id: Option<String>,
    pub device_index: Option<u32>,
    pub link_name: Option<String>,
}

impl EniRecord {
    pub fn new(container_id: &str, region: &str, interface_id: &str, mac_address: &str) -> Self {
        Self {
            version: RECORD_VERSION,
            container_id: container_id.to_string(),
            region: region.to_string(),
            interface_id: interface_id.to_string(),
            mac_address: mac_address.to_string(),
            private_ip: None,
            attachment_id: None,
            device_index: None,
            link_name: None,
        }
    }
}

/// Raw provider responses stored next to the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Create,
    Attach,
    Detach,
    Delete,
}

impl Response {
    pub const ALL: [Response; 4] = [Response::Create, Response::Attach, Response::Detach, Response::Delete];

    pub fn file_name(self) -> &'static str {
        match self {
            Response::Create => "create.json",
            Response::Attach => "attach.json",
            Response::Detach => "detach.json",
            Response::Delete => "delete.json",
        }
    }
}

/// Name of the working directory for a container id
pub fn work_dir_name(container_id: &str) -> &str {
    match container_id.char_indices().nth(PREFIX_LEN) {
        Some((idx, _)) => &container_id[..idx],
        None => container_id,
    }
}

/// Reject container ids that cannot safely name a directory or a handle
pub fn validate_container_id(container_id: &str) -> Result<()> {
    if container_id.is_empty() {
        return Err(EniError::InvalidConfig("container id is empty".to_string()));
    }
    let prefix = work_dir_name(container_id);
    if container_id.contains('/') || container_id.contains('\0') || prefix == "." || prefix == ".." {
        return Err(EniError::InvalidConfig(format!(
            "container id {:?} is not usable as a path component",
            container_id
        )));
    }
    Ok(())
}

/// Working directory for a single container
#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
    container_id: String,
}

impl WorkDir {
    pub fn for_container(state_dir: &Path, container_id: &str) -> Result<Self> {
        validate_container_id(container_id)?;
        Ok(Self {
            path: state_dir.join(work_dir_name(container_id)),
            container_id: container_id.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.path).map_err(|e| self.state_err(&self.path, e))
    }

    /// Load the persisted record. A missing directory or record is `None`;
    /// a record written for a different container is an error.
    pub fn load_record(&self) -> Result<Option<EniRecord>> {
        let path = self.path.join(RECORD_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.state_err(&path, e)),
        };

        let record: EniRecord = serde_json::from_slice(&bytes).map_err(|e| self.state_err(&path, e))?;

        if record.version != RECORD_VERSION {
            return Err(self.state_err(
                &path,
                format!("unsupported record version {}", record.version),
            ));
        }
        if record.container_id != self.container_id {
            return Err(self.state_err(
                &path,
                format!("record belongs to container {}", record.container_id),
            ));
        }

        Ok(Some(record))
    }

    /// Write the record atomically (temp file + rename)
    pub fn save_record(&self, record: &EniRecord) -> Result<()> {
        let path = self.path.join(RECORD_FILE);
        let tmp = self.path.join(format!("{}.tmp", RECORD_FILE));
        let json = serde_json::to_vec_pretty(record).map_err(|e| self.state_err(&path, e))?;

        fs::write(&tmp, json).map_err(|e| self.state_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| self.state_err(&path, e))?;
        debug!(path = %path.display(), interface_id = %record.interface_id, "Saved ENI record");
        Ok(())
    }

    pub fn save_response(&self, kind: Response, body: &str) -> Result<()> {
        let path = self.path.join(kind.file_name());
        fs::write(&path, body).map_err(|e| self.state_err(&path, e))
    }

    pub fn read_response(&self, kind: Response) -> Option<String> {
        fs::read_to_string(self.path.join(kind.file_name())).ok()
    }

    /// Remove the directory; absent is fine
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.state_err(&self.path, e)),
        }
    }

    fn state_err(&self, path: &Path, reason: impl ToString) -> EniError {
        EniError::State {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// List the working directories under `state_dir` that hold a record
pub fn list_records(state_dir: &Path) -> Result<Vec<(PathBuf, EniRecord)>> {
    let entries = match fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(EniError::State {
                path: state_dir.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    let mut records = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path().join(RECORD_FILE);
        let Ok(bytes) = fs::read(&path) else {
            continue;
        };
        match serde_json::from_slice::<EniRecord>(&bytes) {
            Ok(record) => records.push((entry.path(), record)),
            Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }
    records.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(records)
}

/// Host-wide exclusive lock serializing device-index selection and attach.
/// Released when dropped.
#[derive(Debug)]
pub struct HostLock {
    _file: File,
    path: PathBuf,
}

impl HostLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).map_err(|e| EniError::State {
            path: state_dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| EniError::State {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| EniError::State {
            path: path.clone(),
            reason: format!("cannot lock: {}", e),
        })?;
        debug!(path = %path.display(), "Acquired device-index lock");

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_work_dir_name_is_prefix() {
        assert_eq!(work_dir_name("0123456789abcdef"), "01234567");
        assert_eq!(work_dir_name("0123456799999999"), "01234567");
        assert_eq!(work_dir_name("abc"), "abc");
        assert_eq!(work_dir_name("ééééééééé"), "éééééééé");
    }

    #[test]
    fn test_validate_container_id() {
        assert!(validate_container_id("").is_err());
        assert!(validate_container_id("../etc").is_err());
        assert!(validate_container_id("..").is_err());
        assert!(validate_container_id("deadbeef").is_ok());
    }

    #[test]
    fn test_record_persistence() {
        let tmp = TempDir::new().unwrap();
        let dir = WorkDir::for_container(tmp.path(), "deadbeefcafe").unwrap();
        assert!(dir.load_record().unwrap().is_none());

        dir.create().unwrap();
        let mut record = EniRecord::new("deadbeefcafe", "us-east-1", "eni-1", "02:00:00:00:00:01");
        dir.save_record(&record).unwrap();
        record.attachment_id = Some("attach-1".to_string());
        dir.save_record(&record).unwrap();

        let reopened = WorkDir::for_container(tmp.path(), "deadbeefcafe").unwrap();
        assert_eq!(reopened.load_record().unwrap(), Some(record));
        assert_eq!(reopened.path(), tmp.path().join("deadbeef"));

        dir.save_response(Response::Create, r#"{"NetworkInterface":{}}"#).unwrap();
        assert_eq!(reopened.read_response(Response::Create).as_deref(), Some(r#"{"NetworkInterface":{}}"#));
        assert_eq!(reopened.read_response(Response::Delete), None);

        reopened.remove().unwrap();
        assert!(!reopened.exists());
        reopened.remove().unwrap();
    }

    #[test]
    fn test_record_for_other_container_rejected() {
        let tmp = TempDir::new().unwrap();
        let ours = WorkDir::for_container(tmp.path(), "deadbeef-one").unwrap();
        ours.create().unwrap();
        ours.save_record(&EniRecord::new("deadbeef-one", "us-east-1", "eni-1", "m"))
            .unwrap();

        let theirs = WorkDir::for_container(tmp.path(), "deadbeef-two").unwrap();
        assert!(matches!(theirs.load_record(), Err(EniError::State { .. })));
    }

    #[test]
    fn test_list_records() {
        let tmp = TempDir::new().unwrap();
        for id in ["aaaaaaaa1", "bbbbbbbb2"] {
            let dir = WorkDir::for_container(tmp.path(), id).unwrap();
            dir.create().unwrap();
            dir.save_record(&EniRecord::new(id, "us-east-1", "eni-x", "m")).unwrap();
        }
        fs::create_dir_all(tmp.path().join("empty")).unwrap();

        let records = list_records(tmp.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1.container_id, "aaaaaaaa1");
        assert!(list_records(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_host_lock() {
        let tmp = TempDir::new().unwrap();
        let lock = HostLock::acquire(tmp.path()).unwrap();
        assert!(lock.path().exists());
        drop(lock);
        HostLock::acquire(tmp.path()).unwrap();
    }
}
