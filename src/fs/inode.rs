//! Inode-number to backing-path bookkeeping.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The FUSE root inode number, mapped to the empty relative path.
pub const ROOT_INO: u64 = 1;

#[derive(Default)]
struct Maps {
    paths: HashMap<u64, PathBuf>,
    inos: HashMap<PathBuf, u64>,
}

/// Bidirectional map between FUSE inode numbers and paths relative to the
/// backing root. Backing `st_ino` values double as FUSE inode numbers;
/// the root is pinned to [`ROOT_INO`]. Entries are registered during
/// lookup and readdir and dropped on unlink/rmdir.
pub struct InodeTable {
    maps: RwLock<Maps>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            maps: RwLock::new(Maps::default()),
        };
        table.insert(ROOT_INO, PathBuf::new());
        table
    }

    pub fn insert(&self, ino: u64, rel: PathBuf) {
        let mut maps = self.maps.write();
        maps.inos.insert(rel.clone(), ino);
        maps.paths.insert(ino, rel);
    }

    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.maps.read().paths.get(&ino).cloned()
    }

    pub fn ino(&self, rel: &Path) -> Option<u64> {
        self.maps.read().inos.get(rel).copied()
    }

    pub fn forget_path(&self, rel: &Path) {
        let mut maps = self.maps.write();
        if let Some(ino) = maps.inos.remove(rel) {
            maps.paths.remove(&ino);
        }
    }

    /// Re-key `old` to `new`, including everything beneath `old` when a
    /// directory moves.
    pub fn rename(&self, old: &Path, new: &Path) {
        let mut maps = self.maps.write();

        let affected: Vec<(PathBuf, u64)> = maps
            .inos
            .iter()
            .filter(|(rel, _)| rel.starts_with(old))
            .map(|(rel, ino)| (rel.clone(), *ino))
            .collect();

        for (rel, ino) in affected {
            maps.inos.remove(&rel);
            let moved = match rel.strip_prefix(old) {
                Ok(suffix) if !suffix.as_os_str().is_empty() => new.join(suffix),
                _ => new.to_path_buf(),
            };
            maps.inos.insert(moved.clone(), ino);
            maps.paths.insert(ino, moved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preregistered() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::new()));
        assert_eq!(table.ino(Path::new("")), Some(ROOT_INO));
    }

    #[test]
    fn insert_and_resolve_both_ways() {
        let table = InodeTable::new();
        table.insert(42, PathBuf::from("docs/notes.txt"));
        assert_eq!(table.path(42), Some(PathBuf::from("docs/notes.txt")));
        assert_eq!(table.ino(Path::new("docs/notes.txt")), Some(42));
        assert_eq!(table.path(99), None);
    }

    #[test]
    fn forget_removes_both_directions() {
        let table = InodeTable::new();
        table.insert(42, PathBuf::from("gone.txt"));
        table.forget_path(Path::new("gone.txt"));
        assert_eq!(table.path(42), None);
        assert_eq!(table.ino(Path::new("gone.txt")), None);
    }

    #[test]
    fn rename_moves_children() {
        let table = InodeTable::new();
        table.insert(10, PathBuf::from("old"));
        table.insert(11, PathBuf::from("old/a.txt"));
        table.insert(12, PathBuf::from("old/sub/b.txt"));
        table.insert(13, PathBuf::from("older/c.txt"));

        table.rename(Path::new("old"), Path::new("new"));

        assert_eq!(table.path(10), Some(PathBuf::from("new")));
        assert_eq!(table.path(11), Some(PathBuf::from("new/a.txt")));
        assert_eq!(table.path(12), Some(PathBuf::from("new/sub/b.txt")));
        // Sibling with a shared name prefix is untouched.
        assert_eq!(table.path(13), Some(PathBuf::from("older/c.txt")));
        assert_eq!(table.ino(Path::new("old/a.txt")), None);
    }
}
