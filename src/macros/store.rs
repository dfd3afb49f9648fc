use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{is_valid_name, Macro, MacroRef, Origin};
use crate::time::Timestamp;

/// A directory of macro files. The file's mtime is the macro's
/// `modified_at`.
#[derive(Clone, Debug)]
pub struct LocalStore {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            dir: dir.into(),
            extensions: extensions.iter().map(|e| e.trim_start_matches('.').to_lowercase()).collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Path of an existing macro file with this name, whatever its extension.
    fn find(&self, name: &str) -> io::Result<Option<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file()
                && self.accepts(&path)
                && path.file_stem().and_then(|s| s.to_str()) == Some(name)
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Top-level macro files, sorted by name. A missing directory is empty.
    pub fn list(&self) -> io::Result<Vec<MacroRef>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || !self.accepts(&path) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_name(name) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            out.push(MacroRef {
                name: name.to_string(),
                modified_at: Timestamp::from_system_time(modified),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn read(&self, name: &str) -> io::Result<Macro> {
        let path = self
            .find(name)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no local macro {name}")))?;
        let content = fs::read_to_string(&path)?;
        let modified = fs::metadata(&path)?.modified()?;
        Ok(Macro {
            name: name.to_string(),
            content,
            origin: Origin::Local,
            modified_at: Timestamp::from_system_time(modified),
        })
    }

    /// Overwrite an existing file in place, or create `{name}.gcode`.
    pub fn write(&self, name: &str, content: &str) -> io::Result<PathBuf> {
        if !is_valid_name(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid macro name {name:?}"),
            ));
        }
        fs::create_dir_all(&self.dir)?;
        let path = match self.find(name)? {
            Some(path) => path,
            None => self.dir.join(format!("{name}.gcode")),
        };
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn set_modified(&self, name: &str, at: Timestamp) -> io::Result<()> {
        let path = self
            .find(name)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no local macro {name}")))?;
        let file = fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(at.to_system_time())
    }

    /// Returns whether a file was removed.
    pub fn delete(&self, name: &str) -> io::Result<bool> {
        match self.find(name)? {
            Some(path) => {
                fs::remove_file(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every macro file path, for backups.
    pub fn files(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && self.accepts(&path) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}
