//! Scratch directory for cover art, shared by every adapter.
//!
//! Each write gets its own file name, so a reader never sees a file that is
//! being replaced underneath it. Old files are removed by [`ArtworkCache::sweep`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const FILE_PREFIX: &str = "artwork_";

#[derive(Debug)]
pub struct ArtworkCache {
    dir: PathBuf,
    counter: AtomicU64,
}

impl ArtworkCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("playcord"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserves a fresh path inside the cache, creating the directory if needed.
    pub fn next_path(&self, extension: &str) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .dir
            .join(format!("{FILE_PREFIX}{nanos}_{seq}.{extension}")))
    }

    pub async fn store(&self, bytes: &[u8], extension: &str) -> io::Result<PathBuf> {
        let path = self.next_path(extension)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Deletes cached artwork last modified more than `max_age` before `now`.
    pub fn sweep(&self, max_age: Duration, now: SystemTime) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "artwork sweep skipped");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_artwork = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(FILE_PREFIX))
                .unwrap_or(false);
            if !is_artwork {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age > max_age)
                .unwrap_or(false);
            if !stale {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => debug!(path = %path.display(), error = %err, "stale artwork not removed"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::ArtworkCache;
    use std::collections::HashSet;
    use std::time::{Duration, SystemTime};

    fn scratch(name: &str) -> ArtworkCache {
        let dir = std::env::temp_dir().join(format!(
            "playcord-test-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        ArtworkCache::new(dir)
    }

    #[test]
    fn paths_never_collide() {
        let cache = scratch("unique");
        let paths: HashSet<_> = (0..64)
            .map(|_| cache.next_path("jpg").expect("path"))
            .collect();
        assert_eq!(paths.len(), 64);
        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[tokio::test]
    async fn sweep_removes_only_old_artwork() {
        let cache = scratch("sweep");
        let art = cache.store(b"jpeg", "jpg").await.expect("store");
        let other = cache.dir().join("notes.txt");
        std::fs::write(&other, b"keep").expect("write");

        let now = SystemTime::now();
        assert_eq!(cache.sweep(Duration::from_secs(3_600), now), 0);
        assert!(art.exists());

        let later = now + Duration::from_secs(2 * 3_600);
        assert_eq!(cache.sweep(Duration::from_secs(3_600), later), 1);
        assert!(!art.exists());
        assert!(other.exists());
        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[test]
    fn sweeping_a_missing_dir_is_a_no_op() {
        let cache = scratch("missing");
        assert_eq!(cache.sweep(Duration::ZERO, SystemTime::now()), 0);
    }
}
