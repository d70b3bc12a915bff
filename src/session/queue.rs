/// Work-item storage: the queue abstraction and atomic stage-to-stage moves.
///
/// Replays only ever change directory by `rename`, so a crash mid-move leaves
/// the file where it was. The rename out of the queue is also the claim lock:
/// whoever renames first owns the replay.
use std::io;
use std::path::{Path, PathBuf};

/// A source of claimable work items, listed in a deterministic claim order.
pub trait WorkSource {
    /// Every item that could be claimed, first candidate first.
    fn candidates(&self) -> io::Result<Vec<String>>;

    /// Atomically take `name` out of the source, landing it at `dest`.
    /// `MoveError::SourceMissing` means another claimant got there first;
    /// `MoveError::DestinationExists` means `dest` is already occupied.
    fn claim(&self, name: &str, dest: &Path) -> Result<(), MoveError>;

    /// Put an item back so a later claim can retry it. Never replaces an
    /// item of the same name already in the source.
    fn requeue(&self, from: &Path, name: &str) -> Result<(), MoveError>;
}

/// The queue as a plain directory, scanned and sorted lexicographically on
/// every poll.
#[derive(Debug, Clone)]
pub struct DirectoryQueue {
    dir: PathBuf,
    pattern: glob::Pattern,
}

impl DirectoryQueue {
    pub fn new(dir: impl Into<PathBuf>, pattern: glob::Pattern) -> Self {
        Self {
            dir: dir.into(),
            pattern,
        }
    }
}

impl WorkSource for DirectoryQueue {
    /// Every matching file name, sorted lexicographically.
    fn candidates(&self) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if self.pattern.matches(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn claim(&self, name: &str, dest: &Path) -> Result<(), MoveError> {
        move_file_no_replace(&self.dir.join(name), dest)
    }

    fn requeue(&self, from: &Path, name: &str) -> Result<(), MoveError> {
        move_file_no_replace(from, &self.dir.join(name))
    }
}

/// Atomically rename `src` to `dst`, replacing `dst` if it exists.
/// The destination directory is created when missing.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), MoveError> {
    create_parent(src, dst)?;
    rename(src, dst)
}

/// Like [`move_file`], but an occupied `dst` is left untouched and reported
/// as `MoveError::DestinationExists`. A vanished `src` still wins over an
/// occupied `dst`, so the loser of a claim race sees `SourceMissing`.
///
/// Only another item of the same name can appear at `dst` between the check
/// and the rename, and for a claim that item is `src` itself.
pub fn move_file_no_replace(src: &Path, dst: &Path) -> Result<(), MoveError> {
    create_parent(src, dst)?;
    if std::fs::symlink_metadata(dst).is_ok() {
        if std::fs::symlink_metadata(src).is_err() {
            return Err(MoveError::SourceMissing {
                path: src.to_path_buf(),
            });
        }
        return Err(MoveError::DestinationExists {
            path: dst.to_path_buf(),
        });
    }
    rename(src, dst)
}

fn create_parent(src: &Path, dst: &Path) -> Result<(), MoveError> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| MoveError::Io {
            from: src.to_path_buf(),
            to: dst.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

fn rename(src: &Path, dst: &Path) -> Result<(), MoveError> {
    std::fs::rename(src, dst).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound && !src.exists() {
            MoveError::SourceMissing {
                path: src.to_path_buf(),
            }
        } else {
            MoveError::Io {
                from: src.to_path_buf(),
                to: dst.to_path_buf(),
                source: e,
            }
        }
    })
}

/// Errors from moving a work item between stages.
#[derive(Debug)]
pub enum MoveError {
    /// The source vanished, usually because a concurrent claimant won.
    SourceMissing { path: PathBuf },
    /// A same-named item already sits at the destination.
    DestinationExists { path: PathBuf },
    Io {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

impl std::fmt::Display for MoveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoveError::SourceMissing { path } => {
                write!(f, "source {} no longer exists", path.display())
            }
            MoveError::DestinationExists { path } => {
                write!(f, "destination {} already exists", path.display())
            }
            MoveError::Io { from, to, source } => {
                write!(
                    f,
                    "failed to move {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for MoveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MoveError::SourceMissing { .. } | MoveError::DestinationExists { .. } => None,
            MoveError::Io { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue(dir: &Path) -> DirectoryQueue {
        DirectoryQueue::new(dir, glob::Pattern::new("*.StormReplay").unwrap())
    }

    #[test]
    fn test_candidates_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        for name in ["b.StormReplay", "a.StormReplay", "notes.txt", "c.StormReplay"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("d.StormReplay")).unwrap();

        let q = queue(dir.path());
        assert_eq!(
            q.candidates().unwrap(),
            vec!["a.StormReplay", "b.StormReplay", "c.StormReplay"]
        );
    }

    #[test]
    fn test_missing_queue_dir_is_empty() {
        let dir = tempdir().unwrap();
        let q = queue(&dir.path().join("nope"));
        assert!(q.candidates().unwrap().is_empty());
    }

    #[test]
    fn test_claim_moves_into_destination() {
        let dir = tempdir().unwrap();
        let qdir = dir.path().join("queue");
        std::fs::create_dir(&qdir).unwrap();
        std::fs::write(qdir.join("a.StormReplay"), b"replay").unwrap();

        let dest = dir.path().join("active/a.StormReplay");
        queue(&qdir).claim("a.StormReplay", &dest).unwrap();
        assert!(!qdir.join("a.StormReplay").exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"replay");
    }

    #[test]
    fn test_claim_of_vanished_item_is_source_missing() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        let err = q
            .claim("gone.StormReplay", &dir.path().join("active/gone.StormReplay"))
            .unwrap_err();
        assert!(matches!(err, MoveError::SourceMissing { .. }));
    }

    #[test]
    fn test_requeue_returns_item() {
        let dir = tempdir().unwrap();
        let qdir = dir.path().join("queue");
        let active = dir.path().join("active");
        std::fs::create_dir_all(&active).unwrap();
        std::fs::write(active.join("a.StormReplay"), b"x").unwrap();

        queue(&qdir)
            .requeue(&active.join("a.StormReplay"), "a.StormReplay")
            .unwrap();
        assert!(qdir.join("a.StormReplay").exists());
        assert!(!active.join("a.StormReplay").exists());
    }

    #[test]
    fn test_claim_never_clobbers_same_named_item() {
        let dir = tempdir().unwrap();
        let qdir = dir.path().join("queue");
        let active = dir.path().join("active");
        std::fs::create_dir_all(&qdir).unwrap();
        std::fs::create_dir_all(&active).unwrap();
        std::fs::write(qdir.join("a.StormReplay"), b"fresh").unwrap();
        std::fs::write(active.join("a.StormReplay"), b"orphan").unwrap();

        let err = queue(&qdir)
            .claim("a.StormReplay", &active.join("a.StormReplay"))
            .unwrap_err();
        assert!(matches!(err, MoveError::DestinationExists { .. }));
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read(qdir.join("a.StormReplay")).unwrap(), b"fresh");
        assert_eq!(std::fs::read(active.join("a.StormReplay")).unwrap(), b"orphan");
    }

    #[test]
    fn test_requeue_never_clobbers_same_named_item() {
        let dir = tempdir().unwrap();
        let qdir = dir.path().join("queue");
        let active = dir.path().join("active");
        std::fs::create_dir_all(&qdir).unwrap();
        std::fs::create_dir_all(&active).unwrap();
        std::fs::write(qdir.join("a.StormReplay"), b"fresh").unwrap();
        std::fs::write(active.join("a.StormReplay"), b"aborted").unwrap();

        let err = queue(&qdir)
            .requeue(&active.join("a.StormReplay"), "a.StormReplay")
            .unwrap_err();
        assert!(matches!(err, MoveError::DestinationExists { .. }));
        assert_eq!(std::fs::read(qdir.join("a.StormReplay")).unwrap(), b"fresh");
        assert_eq!(std::fs::read(active.join("a.StormReplay")).unwrap(), b"aborted");
    }

    #[test]
    fn test_move_replaces_existing_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("done/src.bin");
        std::fs::create_dir_all(dst.parent().unwrap()).unwrap();
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();

        move_file(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
        assert!(!src.exists());
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        for round in 0..25 {
            let dir = tempdir().unwrap();
            let qdir = dir.path().join("queue");
            let active = dir.path().join("active");
            std::fs::create_dir_all(&qdir).unwrap();
            std::fs::write(qdir.join("only.StormReplay"), format!("round {round}")).unwrap();

            let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let q = queue(&qdir);
                    let dest = active.join("only.StormReplay");
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        q.claim("only.StormReplay", &dest)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let wins = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(wins, 1, "round {round}: {results:?}");
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(MoveError::SourceMissing { .. }))));
            assert_eq!(std::fs::read_dir(&active).unwrap().count(), 1);
            assert_eq!(std::fs::read_dir(&qdir).unwrap().count(), 0);
        }
    }

    #[test]
    fn test_move_error_display() {
        let err = MoveError::SourceMissing {
            path: PathBuf::from("/q/a.StormReplay"),
        };
        assert!(err.to_string().contains("no longer exists"));
    }
}
