use crate::core::interfaces::VirtualSystem;
use crate::utils::{Result, TsbError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Lexical path normalization: resolves `.` and `..` without touching the
/// disk, so unsaved overlay paths normalize the same way real ones do.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `to` expressed relative to `from_dir`, both normalized lexically.
pub fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from = normalize_path(from_dir);
    let to = normalize_path(to);
    let from_parts: Vec<_> = from.components().collect();
    let to_parts: Vec<_> = to.components().collect();
    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..from_parts.len() {
        out.push("..");
    }
    for part in &to_parts[common..] {
        out.push(part.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// The real disk.
pub struct RealSystem;

#[async_trait]
impl VirtualSystem for RealSystem {
    async fn is_file(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path).await.map_err(TsbError::Io)
    }

    async fn mtime(&self, path: &Path) -> Option<u64> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        let modified = meta.modified().ok()?;
        Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(path).await.map_err(TsbError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(TsbError::Io)? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        normalize_path(path)
    }
}

/// Wraps an inner system and overrides chosen files with in-memory content,
/// the composition the compiler-host overlay is built from.
pub struct OverlaySystem {
    inner: Arc<dyn VirtualSystem>,
    files: HashMap<PathBuf, String>,
}

impl OverlaySystem {
    pub fn new(inner: Arc<dyn VirtualSystem>) -> Self {
        Self {
            inner,
            files: HashMap::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.insert(normalize_path(&path.into()), content.into());
        self
    }
}

#[async_trait]
impl VirtualSystem for OverlaySystem {
    async fn is_file(&self, path: &Path) -> bool {
        self.files.contains_key(&normalize_path(path)) || self.inner.is_file(path).await
    }

    async fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path).await
    }

    async fn read(&self, path: &Path) -> Result<String> {
        if let Some(content) = self.files.get(&normalize_path(path)) {
            return Ok(content.clone());
        }
        self.inner.read(path).await
    }

    async fn mtime(&self, path: &Path) -> Option<u64> {
        if self.files.contains_key(&normalize_path(path)) {
            return Some(0);
        }
        self.inner.mtime(path).await
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        self.inner.list_dir(path).await
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        self.inner.resolve_path(path)
    }
}

/// Shared source-text cache keyed by path, invalidated on mtime change.
pub struct SourceCache {
    system: Arc<dyn VirtualSystem>,
    entries: Mutex<HashMap<PathBuf, (u64, Arc<String>)>>,
}

impl SourceCache {
    pub fn new(system: Arc<dyn VirtualSystem>) -> Self {
        Self {
            system,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the source text and its mtime, rereading when stale.
    pub async fn get(&self, path: &Path) -> Result<(Arc<String>, u64)> {
        let mtime = self.system.mtime(path).await.unwrap_or(0);
        if let Some((cached_mtime, text)) = self.entries.lock().get(path) {
            if *cached_mtime == mtime {
                return Ok((text.clone(), mtime));
            }
        }
        let text = Arc::new(self.system.read(path).await?);
        self.entries
            .lock()
            .insert(path.to_path_buf(), (mtime, text.clone()));
        Ok((text, mtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths() {
        assert_eq!(
            relative_path(Path::new("/proj/out"), Path::new("/proj/src/a.ts")),
            PathBuf::from("../src/a.ts")
        );
        assert_eq!(
            relative_path(Path::new("/proj"), Path::new("/proj/a.ts")),
            PathBuf::from("a.ts")
        );
        assert_eq!(
            relative_path(Path::new("/proj"), Path::new("/proj")),
            PathBuf::from(".")
        );
    }

    #[test]
    fn normalizes_dots() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d.ts")),
            PathBuf::from("/a/c/d.ts")
        );
        assert_eq!(normalize_path(Path::new("a/./b")), PathBuf::from("a/b"));
        assert_eq!(normalize_path(Path::new("../x")), PathBuf::from("../x"));
    }

    #[tokio::test]
    async fn overlay_overrides_chosen_paths() {
        let dir = tempfile::tempdir().unwrap();
        let real_path = dir.path().join("real.ts");
        tokio::fs::write(&real_path, "on disk").await.unwrap();

        let system = OverlaySystem::new(Arc::new(RealSystem))
            .with_file(dir.path().join("ghost.ts"), "in memory");

        assert!(system.is_file(&dir.path().join("ghost.ts")).await);
        assert_eq!(
            system.read(&dir.path().join("ghost.ts")).await.unwrap(),
            "in memory"
        );
        assert_eq!(system.read(&real_path).await.unwrap(), "on disk");
    }

    #[tokio::test]
    async fn source_cache_rereads_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.ts");
        tokio::fs::write(&path, "v1").await.unwrap();

        let cache = SourceCache::new(Arc::new(RealSystem));
        let (first, _) = cache.get(&path).await.unwrap();
        assert_eq!(first.as_str(), "v1");

        tokio::fs::write(&path, "v2").await.unwrap();
        // Force a visible mtime change even on coarse filesystems.
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(future).ok();
        drop(file);

        let (second, _) = cache.get(&path).await.unwrap();
        assert_eq!(second.as_str(), "v2");
    }
}
