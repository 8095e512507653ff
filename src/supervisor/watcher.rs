//! Modification-time polling for `worker --watch`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

/// Directories never worth restarting for.
const IGNORED_DIRS: &[&str] = &["target", "node_modules", "__pycache__"];

fn is_ignored(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && IGNORED_DIRS.contains(&name.as_ref()))
}

/// File mtimes under `root`, skipping hidden entries and build output.
pub fn snapshot(root: &Path) -> HashMap<PathBuf, SystemTime> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.into_path(), modified))
        })
        .collect()
}

/// Detects file changes between successive polls.
#[derive(Debug)]
pub struct FileWatcher {
    root: PathBuf,
    last: HashMap<PathBuf, SystemTime>,
}

impl FileWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let last = snapshot(&root);
        Self { root, last }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files added, removed or modified since the previous call.
    pub fn poll(&mut self) -> Vec<PathBuf> {
        let current = snapshot(&self.root);
        let mut changed: Vec<PathBuf> = current
            .iter()
            .filter(|(path, mtime)| self.last.get(*path) != Some(*mtime))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            self.last
                .keys()
                .filter(|path| !current.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        self.last = current;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn touch_later(path: &Path, contents: &str) {
        fs::write(path, contents).expect("write");
        let file = fs::File::options().write(true).open(path).expect("open");
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .expect("set mtime");
    }

    #[test]
    fn test_no_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("app.rs"), "fn main() {}").expect("write");

        let mut watcher = FileWatcher::new(dir.path());
        assert!(watcher.poll().is_empty());
    }

    #[test]
    fn test_detects_modify_add_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = dir.path().join("app.rs");
        let lib = dir.path().join("lib.rs");
        fs::write(&app, "v1").expect("write");
        fs::write(&lib, "v1").expect("write");

        let mut watcher = FileWatcher::new(dir.path());

        touch_later(&app, "v2");
        assert_eq!(watcher.poll(), vec![app.clone()]);

        let new = dir.path().join("new.rs");
        fs::write(&new, "x").expect("write");
        fs::remove_file(&lib).expect("remove");
        assert_eq!(watcher.poll(), vec![lib, new]);

        assert!(watcher.poll().is_empty());
    }

    #[test]
    fn test_ignores_hidden_and_build_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("target")).expect("mkdir");
        fs::create_dir(dir.path().join(".git")).expect("mkdir");

        let mut watcher = FileWatcher::new(dir.path());
        fs::write(dir.path().join("target").join("out.o"), "x").expect("write");
        fs::write(dir.path().join(".git").join("HEAD"), "x").expect("write");
        fs::write(dir.path().join(".swp"), "x").expect("write");

        assert!(watcher.poll().is_empty());
    }
}
