use crate::core::models::{ImportInfo, RefinedModule};
use crate::utils::{Result, TsbError};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{trace, warn};

/// Trailing marker of a complete cache file. A file without it is a miss;
/// the store never partial-reads.
pub const CACHE_SIGNATURE: &str = "TSBUNDLE_CACHE_END";

const FIELD_COUNT: usize = 11;

/// Everything needed to decide whether a cache entry is still fresh.
#[derive(Debug, Clone)]
pub struct CacheValidity<'a> {
    /// Expected `// <relative path>` first content line (id-reuse guard).
    pub rpath: &'a str,
    pub source_mtime: u64,
    pub tsconfig_mtime: u64,
    /// Set when declarations are requested and a `.d.ts` sibling exists.
    pub dts_mtime: Option<u64>,
}

/// One file per integer id, named by the decimal id, written and read under
/// a per-id lock so load, store and delete never overlap.
pub struct CacheStore {
    dir: PathBuf,
    locks: DashMap<u32, Arc<Mutex<()>>>,
}

impl CacheStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The per-id namelock.
    pub async fn lock(&self, id: u32) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn path_for(&self, id: u32) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Loads and validates the entry for `id`. Stale or malformed entries
    /// are evicted under the lock and reported as a miss.
    pub async fn load(&self, id: u32, validity: &CacheValidity<'_>) -> Option<RefinedModule> {
        let _guard = self.lock(id).await;
        let path = self.path_for(id);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        let cache_mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)?;

        let fresh = cache_mtime >= validity.tsconfig_mtime
            && cache_mtime >= validity.source_mtime
            && validity.dts_mtime.map_or(true, |dts| cache_mtime >= dts);
        if !fresh {
            trace!("cache #{} stale, evicting", id);
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }

        let bytes = tokio::fs::read(&path).await.ok()?;
        let module = match deserialize(&bytes) {
            Some(module) => module,
            None => {
                warn!("cache #{} is malformed, evicting", id);
                let _ = tokio::fs::remove_file(&path).await;
                return None;
            }
        };

        let expected_first = format!("// {}", validity.rpath);
        if module.content.lines().next() != Some(expected_first.as_str()) {
            trace!("cache #{} belongs to another path, evicting", id);
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        Some(module)
    }

    /// Persists one refined artifact. Errored artifacts must not reach this.
    pub async fn store(&self, id: u32, module: &RefinedModule) -> Result<()> {
        debug_assert!(!module.errored);
        let _guard = self.lock(id).await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(TsbError::Io)?;
        let bytes = serialize(module);
        tokio::fs::write(self.path_for(id), bytes)
            .await
            .map_err(TsbError::Io)?;
        Ok(())
    }

    pub async fn remove(&self, id: u32) -> Result<()> {
        let _guard = self.lock(id).await;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TsbError::Io(err)),
        }
    }

    /// Wipes the whole cache directory (`--clear-cache`).
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TsbError::Io(err)),
        }
    }
}

/// NUL-separated field layout, `CACHE_SIGNATURE` last:
/// mtimes, imports json, first-line comment, line offsets, map, content,
/// declarations.
pub fn serialize(module: &RefinedModule) -> Vec<u8> {
    let imports = serde_json::Value::Array(module.imports.iter().map(ImportInfo::to_json).collect());
    let fields: [String; FIELD_COUNT] = [
        module.source_mtime.to_string(),
        module.dts_mtime.to_string(),
        module.tsconfig_mtime.to_string(),
        imports.to_string(),
        module.first_line_comment.clone().unwrap_or_default(),
        module.source_map_output_line_offset.to_string(),
        module.output_line_count.to_string(),
        module.source_map_text.clone().unwrap_or_default(),
        module.content.clone(),
        module.declaration.clone().unwrap_or_default(),
        module.global_declaration.clone().unwrap_or_default(),
    ];
    let mut out = Vec::new();
    for field in &fields {
        out.extend_from_slice(field.as_bytes());
        out.push(0);
    }
    out.extend_from_slice(CACHE_SIGNATURE.as_bytes());
    out
}

pub fn deserialize(bytes: &[u8]) -> Option<RefinedModule> {
    let parts: Vec<&[u8]> = bytes.split(|b| *b == 0).collect();
    if parts.len() != FIELD_COUNT + 1 || parts[FIELD_COUNT] != CACHE_SIGNATURE.as_bytes() {
        return None;
    }
    let text = |i: usize| std::str::from_utf8(parts[i]).ok();
    let num = |i: usize| text(i).and_then(|t| t.parse::<u64>().ok());
    let opt = |i: usize| {
        text(i).and_then(|t| {
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
    };

    let imports_value: serde_json::Value = serde_json::from_str(text(3)?).ok()?;
    let imports = imports_value
        .as_array()?
        .iter()
        .map(ImportInfo::from_json)
        .collect::<Option<Vec<_>>>()?;

    let mut module = RefinedModule {
        source_mtime: num(0)?,
        dts_mtime: num(1)?,
        tsconfig_mtime: num(2)?,
        imports,
        first_line_comment: opt(4),
        source_map_output_line_offset: num(5)? as u32,
        output_line_count: num(6)? as u32,
        source_map_text: opt(7),
        content: text(8)?.to_string(),
        declaration: opt(9),
        global_declaration: opt(10),
        errored: false,
        size: 0,
    };
    module.compute_size();
    Some(module)
}
