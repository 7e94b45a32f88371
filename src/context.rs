use crate::cache::{CacheStore, MemoryCache, DEFAULT_IDLE_EXPIRY, DEFAULT_MEMORY_BUDGET};
use crate::core::models::{ModuleId, ScriptKind};
use crate::registry::IdRegistry;
use crate::utils::{Logger, Result, TsbError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const REGISTRY_FILE: &str = "registry.json";

/// Long-lived state shared by every concurrent bundle: the id registry and
/// its persistence, both cache tiers, the global error counter and the set
/// of claimed output paths.
///
/// Constructed once in `main` and passed down as `Arc<MainContext>`; the
/// shutdown path flushes the registry synchronously.
pub struct MainContext {
    registry: Mutex<IdRegistry>,
    registry_path: PathBuf,
    memory_cache: Mutex<MemoryCache>,
    disk_cache: CacheStore,
    error_count: AtomicUsize,
    claimed_outputs: Mutex<HashSet<PathBuf>>,
    /// Serializes re-entrant async saves; `dirty` queues one more round.
    saving: AtomicBool,
    dirty: AtomicBool,
}

impl MainContext {
    pub fn new(cache_dir: PathBuf, memory_budget: usize, idle_expiry: Duration) -> Arc<Self> {
        let ctx = Arc::new(Self {
            registry: Mutex::new(IdRegistry::new()),
            registry_path: cache_dir.join(REGISTRY_FILE),
            memory_cache: Mutex::new(MemoryCache::new(memory_budget, idle_expiry)),
            disk_cache: CacheStore::new(cache_dir),
            error_count: AtomicUsize::new(0),
            claimed_outputs: Mutex::new(HashSet::new()),
            saving: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        });
        if let Err(err) = ctx.registry.lock().load(&ctx.registry_path) {
            Logger::warn(&format!("could not load module registry: {}", err));
        }
        ctx
    }

    pub fn with_defaults(cache_dir: PathBuf) -> Arc<Self> {
        Self::new(cache_dir, DEFAULT_MEMORY_BUDGET, DEFAULT_IDLE_EXPIRY)
    }

    pub fn disk_cache(&self) -> &CacheStore {
        &self.disk_cache
    }

    pub fn memory_cache(&self) -> &Mutex<MemoryCache> {
        &self.memory_cache
    }

    /// Reports an error through the log and counts it toward the exit code.
    pub fn report(&self, err: &TsbError) {
        Logger::error(&err.report());
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Two live bundlers must not share one output path.
    pub fn claim_output(&self, output: &Path) -> Result<()> {
        let mut claimed = self.claimed_outputs.lock();
        if !claimed.insert(output.to_path_buf()) {
            return Err(TsbError::Duplicated {
                output: output.display().to_string(),
            });
        }
        Ok(())
    }

    pub fn release_output(&self, output: &Path) {
        self.claimed_outputs.lock().remove(output);
    }

    pub fn module_id(&self, output_key: &str, apath: &str, kind: ScriptKind) -> Arc<ModuleId> {
        self.mark_dirty();
        self.registry.lock().get_or_allocate(output_key, apath, kind)
    }

    pub fn known_module_id(&self, output_key: &str, apath: &str) -> Option<Arc<ModuleId>> {
        self.registry.lock().get(output_key, apath)
    }

    pub fn module_ids(&self, output_key: &str) -> Vec<Arc<ModuleId>> {
        self.registry.lock().module_ids(output_key)
    }

    /// Drops a module's id and removes its cache file under the per-id lock.
    pub async fn delete_module(&self, output_key: &str, apath: &str) -> Result<()> {
        let freed = self.registry.lock().delete(output_key, apath);
        if let Some(id) = freed {
            self.mark_dirty();
            self.memory_cache.lock().expire(id);
            self.disk_cache.remove(id).await?;
        }
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Asynchronous save with re-entrancy protection: one save in flight at
    /// a time; a save requested meanwhile reruns after the current one.
    pub async fn save_registry(&self) {
        if self
            .saving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.dirty.store(true, Ordering::SeqCst);
            return;
        }
        loop {
            self.dirty.store(false, Ordering::SeqCst);
            let snapshot = self.registry.lock().snapshot();
            let path = self.registry_path.clone();
            let result = tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, snapshot)
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => Logger::warn(&format!("registry save failed: {}", err)),
                Err(err) => Logger::warn(&format!("registry save task failed: {}", err)),
            }
            if !self.dirty.load(Ordering::SeqCst) {
                break;
            }
        }
        self.saving.store(false, Ordering::SeqCst);
    }

    /// Synchronous flush for process exit. Skipped while an async save is
    /// mid-write so the two cannot interleave.
    pub fn flush_registry_sync(&self) {
        if self.saving.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.registry.lock().save(&self.registry_path) {
            Logger::warn(&format!("registry flush failed: {}", err));
        }
    }

    /// `--clear-cache`: wipes the cache directory, registry included.
    pub async fn clear_cache(&self) -> Result<()> {
        self.disk_cache.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claims_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MainContext::with_defaults(dir.path().join("cache"));
        ctx.claim_output(Path::new("/out.js")).unwrap();
        let err = ctx.claim_output(Path::new("/out.js")).unwrap_err();
        assert_eq!(err.code(), Some(20003));
        ctx.release_output(Path::new("/out.js"));
        ctx.claim_output(Path::new("/out.js")).unwrap();
    }

    #[tokio::test]
    async fn registry_persists_across_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        {
            let ctx = MainContext::with_defaults(cache_dir.clone());
            let id = ctx.module_id("out.js", "/src/a.ts", ScriptKind::Ts);
            assert_eq!(id.integer_id, 1);
            ctx.save_registry().await;
        }
        let ctx = MainContext::with_defaults(cache_dir);
        let id = ctx.known_module_id("out.js", "/src/a.ts").unwrap();
        assert_eq!(id.integer_id, 1);
        assert_eq!(id.var_name, "a");
    }

    #[tokio::test]
    async fn delete_frees_id_and_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MainContext::with_defaults(dir.path().join("cache"));
        let id = ctx.module_id("out.js", "/src/a.ts", ScriptKind::Ts);
        ctx.delete_module("out.js", "/src/a.ts").await.unwrap();
        assert!(ctx.known_module_id("out.js", "/src/a.ts").is_none());
        let recycled = ctx.module_id("out.js", "/src/b.ts", ScriptKind::Ts);
        assert_eq!(recycled.integer_id, id.integer_id);
    }

    #[tokio::test]
    async fn error_counting() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MainContext::with_defaults(dir.path().join("cache"));
        assert_eq!(ctx.error_count(), 0);
        ctx.count_error();
        assert_eq!(ctx.error_count(), 1);
    }
}
