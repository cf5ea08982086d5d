use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            other => result.push(other.as_os_str()),
        }
    }
    result
}

/// Resolves both paths (via `canonicalize` when the filesystem allows it,
/// falling back to lexical normalization for paths that don't exist yet —
/// e.g. a directory entry observed mid-write) and checks containment.
fn is_contained(base_dir: &Path, target: &Path) -> bool {
    let base = std::fs::canonicalize(base_dir).unwrap_or_else(|_| normalize_path(base_dir));
    let target = std::fs::canonicalize(target).unwrap_or_else(|_| normalize_path(target));
    target.starts_with(&base)
}

/// Tails rolling `*.log` files written by a child process into a scratch
/// directory, tracking a byte offset per file so repeated polls only return
/// newly-appended content.
pub struct LogTailer {
    base_dir: PathBuf,
    offsets: HashMap<PathBuf, u64>,
}

impl LogTailer {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            offsets: HashMap::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn tracked_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.offsets.keys()
    }

    /// Reads bytes appended to `target` since the last call for that path.
    /// Returns `None` without tracking the file if `target` is not strictly
    /// contained within the tailer's base directory (path-traversal guard),
    /// or if the file cannot be read.
    pub fn read_new_log_content(&mut self, target: &Path) -> Option<String> {
        if !is_contained(&self.base_dir, target) {
            return None;
        }

        let mut file = File::open(target).ok()?;
        let len = file.metadata().ok()?.len();
        let offset = *self.offsets.entry(target.to_path_buf()).or_insert(0);
        if len <= offset {
            return Some(String::new());
        }

        file.seek(SeekFrom::Start(offset)).ok()?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        file.read_to_end(&mut buf).ok()?;
        self.offsets.insert(target.to_path_buf(), len);
        Some(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Lists `*.log` files directly inside the base directory, skipping
    /// anything that fails the containment check (e.g. a symlink escape).
    pub fn discover_log_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "log").unwrap_or(false))
            .filter(|path| is_contained(&self.base_dir, path))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_outside_base_dir_is_never_tracked() {
        let mut tailer = LogTailer::new(PathBuf::from("/tmp/safe"));
        let result = tailer.read_new_log_content(Path::new("/var/log/outside"));
        assert!(result.is_none());
        assert_eq!(tailer.tracked_files().count(), 0);
    }

    #[test]
    fn traversal_via_parent_segments_is_rejected() {
        let mut tailer = LogTailer::new(PathBuf::from("/tmp/safe"));
        let result = tailer.read_new_log_content(Path::new("/tmp/safe/../../etc/passwd"));
        assert!(result.is_none());
        assert_eq!(tailer.tracked_files().count(), 0);
    }

    #[test]
    fn reads_only_bytes_past_last_offset() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("agent.log");
        std::fs::write(&log_path, b"line one\n").unwrap();

        let mut tailer = LogTailer::new(dir.path().to_path_buf());
        let first = tailer.read_new_log_content(&log_path).unwrap();
        assert_eq!(first, "line one\n");

        std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
        f.write_all(b"line two\n").unwrap();

        let second = tailer.read_new_log_content(&log_path).unwrap();
        assert_eq!(second, "line two\n");
    }

    #[test]
    fn discover_log_files_only_returns_log_extension_files_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), b"x").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"x").unwrap();

        let tailer = LogTailer::new(dir.path().to_path_buf());
        let found = tailer.discover_log_files();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_name().unwrap(), "a.log");
    }
}
