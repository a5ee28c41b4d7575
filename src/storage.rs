//! Storage target: a writable directory with enough headroom. Mount selection
//! is external; the pipeline only needs "preferred if usable, else fallback",
//! a free-space query, and crash-safe writes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};

use crate::error::StorageError;

#[derive(Clone, Debug)]
pub struct StorageTarget {
    root: PathBuf,
    min_free_mb: u64,
}

impl StorageTarget {
    /// Pick the preferred directory when it exists and is writable, else the
    /// fallback (created if missing).
    pub fn select(preferred: &Path, fallback: &Path, min_free_mb: u64) -> Result<Self, StorageError> {
        if dir_writable(preferred) {
            info!("[storage] using preferred target {}", preferred.display());
            return Ok(Self { root: preferred.to_path_buf(), min_free_mb });
        }
        fs::create_dir_all(fallback)?;
        if !dir_writable(fallback) {
            return Err(StorageError::Unreachable(fallback.to_path_buf()));
        }
        info!(
            "[storage] preferred target {} unavailable, using fallback {}",
            preferred.display(),
            fallback.display()
        );
        Ok(Self { root: fallback.to_path_buf(), min_free_mb })
    }

    /// Wrap an already-chosen directory (session subdirectories).
    pub fn at(root: PathBuf, min_free_mb: u64) -> Result<Self, StorageError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, min_free_mb })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reachability and headroom check, run before every record write.
    pub fn verify(&self) -> Result<(), StorageError> {
        if !self.root.is_dir() {
            return Err(StorageError::Unreachable(self.root.clone()));
        }
        if let Some(available_mb) = free_space_mb(&self.root) {
            if available_mb < self.min_free_mb {
                return Err(StorageError::InsufficientSpace {
                    path: self.root.clone(),
                    available_mb,
                    required_mb: self.min_free_mb,
                });
            }
        }
        Ok(())
    }

    /// Write bytes so a crash mid-write never leaves a partial artifact
    /// visible under the final name: temporary sibling, then rename.
    pub fn atomic_write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let final_path = self.root.join(name);
        let tmp_path = self.root.join(format!(".{name}.tmp"));
        fs::write(&tmp_path, bytes)?;
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StorageError::Io(e));
        }
        Ok(final_path)
    }
}

fn dir_writable(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let probe = path.join(".write_probe");
    match fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Free space on the filesystem holding `path`, via `df -Pk`. `None` when the
/// query itself is unavailable; headroom is then not enforced.
pub fn free_space_mb(path: &Path) -> Option<u64> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(path)
        .output()
        .ok()?;
    if !output.status.success() {
        warn!("[storage] df query failed for {}", path.display());
        return None;
    }
    parse_df_available_kb(&String::from_utf8_lossy(&output.stdout)).map(|kb| kb / 1024)
}

/// POSIX `df -Pk` output: header line, then
/// `filesystem 1024-blocks used available capacity mount`.
fn parse_df_available_kb(output: &str) -> Option<u64> {
    let line = output.lines().nth(1)?;
    let available = line.split_whitespace().nth(3)?;
    available.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_select_prefers_existing_writable_dir() {
        let preferred = tempdir().unwrap();
        let fallback = tempdir().unwrap();
        let target =
            StorageTarget::select(preferred.path(), fallback.path(), 0).unwrap();
        assert_eq!(target.root(), preferred.path());
    }

    #[test]
    fn test_select_falls_back_when_preferred_missing() {
        let fallback = tempdir().unwrap();
        let fallback_dir = fallback.path().join("sessions");
        let target = StorageTarget::select(
            Path::new("/nonexistent/removable"),
            &fallback_dir,
            0,
        )
        .unwrap();
        assert_eq!(target.root(), fallback_dir);
        assert!(fallback_dir.is_dir());
    }

    #[test]
    fn test_atomic_write_leaves_no_temporary() {
        let dir = tempdir().unwrap();
        let target = StorageTarget::at(dir.path().to_path_buf(), 0).unwrap();

        let written = target.atomic_write("record.json", b"{\"ok\":true}").unwrap();
        assert_eq!(fs::read(&written).unwrap(), b"{\"ok\":true}");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_verify_fails_when_root_vanishes() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("gone");
        let target = StorageTarget::at(root.clone(), 0).unwrap();
        assert!(target.verify().is_ok());

        fs::remove_dir_all(&root).unwrap();
        assert!(matches!(target.verify(), Err(StorageError::Unreachable(_))));
    }

    #[test]
    fn test_parse_df_available_column() {
        let output = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                      /dev/sda1 61255492 21000000 37114816 37% /media/survey\n";
        assert_eq!(parse_df_available_kb(output), Some(37_114_816));
        assert_eq!(parse_df_available_kb("garbage"), None);
    }
}
