use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::LocalStore;
use crate::error::{DebuggerError, Result};
use crate::time::Timestamp;

pub const BACKUP_DIR: &str = ".backups";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    created_at: Timestamp,
    reason: String,
    files: Vec<ManifestEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    file: String,
    modified_at: Timestamp,
    size: u64,
}

/// Archive every macro file into `<dir>/.backups/<unix-ms>.zip` and prune
/// down to `limit` archives. Returns `None` when there is nothing to save.
pub fn create_backup(store: &LocalStore, reason: &str, limit: usize) -> Result<Option<PathBuf>> {
    let files = store.files()?;
    if files.is_empty() {
        return Ok(None);
    }

    let backup_dir = store.dir().join(BACKUP_DIR);
    fs::create_dir_all(&backup_dir)?;
    let created_at = Timestamp::now();
    let path = backup_dir.join(format!("{}.zip", created_at.as_unix_millis()));

    let file = fs::File::create(&path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut entries = Vec::with_capacity(files.len());
    for file_path in &files {
        let Some(file_name) = file_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let content = fs::read(file_path)?;
        let meta = fs::metadata(file_path)?;
        zip.start_file(file_name.to_string(), options)?;
        zip.write_all(&content)?;
        entries.push(ManifestEntry {
            file: file_name.to_string(),
            modified_at: Timestamp::from_system_time(meta.modified()?),
            size: meta.len(),
        });
    }

    let manifest = Manifest {
        created_at,
        reason: reason.to_string(),
        files: entries,
    };
    zip.start_file("manifest.json", options)?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
    zip.finish()?;

    tracing::info!("backed up {} macros to {}", files.len(), path.display());
    prune(&backup_dir, limit)?;
    Ok(Some(path))
}

/// Archives in `dir`, oldest first.
pub fn list_backups(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut backups: Vec<(i64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().and_then(|x| x.to_str()) != Some("zip") {
                return None;
            }
            let stamp = path.file_stem()?.to_str()?.parse::<i64>().ok()?;
            Some((stamp, path))
        })
        .collect();
    backups.sort_by_key(|(stamp, _)| *stamp);
    Ok(backups.into_iter().map(|(_, p)| p).collect())
}

fn prune(dir: &Path, limit: usize) -> Result<()> {
    let backups = list_backups(dir)?;
    let excess = backups.len().saturating_sub(limit.max(1));
    for old in &backups[..excess] {
        if let Err(e) = fs::remove_file(old) {
            return Err(DebuggerError::Custom(format!(
                "could not remove old backup {}: {e}",
                old.display()
            )));
        }
    }
    Ok(())
}
