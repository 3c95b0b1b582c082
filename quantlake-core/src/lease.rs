//! Per-model exclusive lease guarding a dataset directory.
//!
//! A lease is a lock file created with exclusive-create semantics. It records
//! the owning process and acquisition time; a lease older than the stale
//! timeout is taken over. Dropping the lease releases it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EtlError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseInfo {
    model: String,
    pid: u32,
    acquired_at: NaiveDateTime,
}

/// Held for the duration of one run of one model.
#[derive(Debug)]
pub struct ModelLease {
    path: PathBuf,
}

impl ModelLease {
    /// Acquire the lease for `model` under `lock_dir`.
    ///
    /// Fails with [`EtlError::Busy`] while another live lease exists.
    pub fn acquire(lock_dir: &Path, model: &str, stale_after: Duration) -> Result<Self, EtlError> {
        fs::create_dir_all(lock_dir)
            .map_err(|e| EtlError::Save(format!("create lock dir: {e}")))?;
        let path = lock_dir.join(format!("{}.lock", model.replace(['/', '\\'], "_")));

        match try_create(&path, model) {
            Ok(()) => return Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(EtlError::Save(format!("create lease {}: {e}", path.display()))),
        }

        let holder = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<LeaseInfo>(&content).ok());
        // A lease file nobody can parse (crash between create and write) ages by mtime.
        let (owner, pid, age) = match holder {
            Some(holder) => (
                format!("pid {} since {}", holder.pid, holder.acquired_at),
                Some(holder.pid),
                chrono::Local::now().naive_local() - holder.acquired_at,
            ),
            None => ("unknown owner".to_string(), None, file_age(&path)?),
        };
        if age <= stale_after {
            return Err(EtlError::Busy {
                model: model.to_string(),
                holder: owner,
            });
        }

        warn!(
            model,
            pid,
            age_secs = age.num_seconds(),
            "taking over stale lease"
        );
        let _ = fs::remove_file(&path);
        match try_create(&path, model) {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(EtlError::Busy {
                model: model.to_string(),
                holder: "concurrent takeover".into(),
            }),
            Err(e) => Err(EtlError::Save(format!("create lease {}: {e}", path.display()))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn try_create(path: &Path, model: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let info = LeaseInfo {
        model: model.to_string(),
        pid: std::process::id(),
        acquired_at: chrono::Local::now().naive_local(),
    };
    let written = serde_json::to_vec(&info)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        .and_then(|json| {
            file.write_all(&json)?;
            file.flush()
        });
    if written.is_err() {
        drop(file);
        let _ = fs::remove_file(path);
    }
    written
}

/// Time since the lock file was last modified.
fn file_age(path: &Path) -> Result<Duration, EtlError> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| EtlError::Save(format!("inspect lease {}: {e}", path.display())))?;
    let elapsed = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    Ok(Duration::from_std(elapsed).unwrap_or(Duration::MAX))
}
