use crate::core::models::{ModuleId, ScriptKind};
use crate::utils::{Result, TsbError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};

/// Bumped whenever the snapshot or cache-file layout changes; a mismatch
/// discards the whole registry (and with it the disk cache's validity).
pub const CACHE_VERSION: &str = "tsbundle-cache-2";

/// Registries for outputs not rebuilt within this window are dropped at
/// save time.
const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Never allocated as module variable names.
const RESERVED_NAMES: [&str; 3] = ["_", "entry", "require"];

const JS_KEYWORDS: [&str; 41] = [
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "import", "in", "instanceof", "let", "new", "null", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
    "arguments",
];

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Id bookkeeping for a single output file.
#[derive(Debug, Default)]
struct OutputRegistry {
    modules: HashMap<String, Arc<ModuleId>>,
    taken_names: HashSet<String>,
    free_ids: Vec<u32>,
    last_id: u32,
    /// Millis timestamp past which this registry may be evicted.
    retention: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputSnapshot {
    retention: u64,
    last_id: u32,
    free_ids: Vec<u32>,
    modules: Vec<ModuleId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    version: String,
    outputs: HashMap<String, OutputSnapshot>,
}

/// Maps absolute source paths to stable `ModuleId`s, one namespace per
/// output file, persisted as a JSON snapshot across runs.
#[derive(Debug, Default)]
pub struct IdRegistry {
    outputs: HashMap<String, OutputRegistry>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing id for `apath` or allocates a fresh one with a
    /// unique JavaScript-safe variable name.
    pub fn get_or_allocate(
        &mut self,
        output_key: &str,
        apath: &str,
        kind: ScriptKind,
    ) -> Arc<ModuleId> {
        let output = self.outputs.entry(output_key.to_string()).or_default();
        output.retention = now_millis() + RETENTION.as_millis() as u64;

        if let Some(existing) = output.modules.get(apath) {
            if existing.kind != kind {
                // Id reuse with a different script kind; the cache validity
                // check catches the stale artifact.
                warn!(
                    "internal error TS20000: module kind changed for {} ({:?} -> {:?})",
                    apath, existing.kind, kind
                );
            }
            return existing.clone();
        }

        let var_name = allocate_var_name(&base_name_for(apath), &output.taken_names);
        let integer_id = match output.free_ids.pop() {
            Some(id) => id,
            None => {
                output.last_id += 1;
                output.last_id
            }
        };
        let id = Arc::new(ModuleId {
            integer_id,
            var_name: var_name.clone(),
            apath: apath.to_string(),
            kind,
        });
        output.taken_names.insert(var_name);
        output.modules.insert(apath.to_string(), id.clone());
        trace!("allocated #{} {} for {}", integer_id, id.var_name, apath);
        id
    }

    pub fn get(&self, output_key: &str, apath: &str) -> Option<Arc<ModuleId>> {
        self.outputs.get(output_key)?.modules.get(apath).cloned()
    }

    /// Drops the mapping and returns the freed integer id so the caller can
    /// remove the corresponding cache file under its lock.
    pub fn delete(&mut self, output_key: &str, apath: &str) -> Option<u32> {
        let output = self.outputs.get_mut(output_key)?;
        let id = output.modules.remove(apath)?;
        output.taken_names.remove(&id.var_name);
        output.free_ids.push(id.integer_id);
        Some(id.integer_id)
    }

    /// All ids currently registered for one output.
    pub fn module_ids(&self, output_key: &str) -> Vec<Arc<ModuleId>> {
        self.outputs
            .get(output_key)
            .map(|o| o.modules.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Serializes to JSON, discarding registries idle past their retention
    /// timestamp.
    pub fn snapshot(&self) -> String {
        let now = now_millis();
        let outputs = self
            .outputs
            .iter()
            .filter(|(_, o)| o.retention >= now)
            .map(|(key, o)| {
                let mut modules: Vec<ModuleId> =
                    o.modules.values().map(|m| (**m).clone()).collect();
                modules.sort_by_key(|m| m.integer_id);
                (
                    key.clone(),
                    OutputSnapshot {
                        retention: o.retention,
                        last_id: o.last_id,
                        free_ids: o.free_ids.clone(),
                        modules,
                    },
                )
            })
            .collect();
        let snapshot = RegistrySnapshot {
            version: CACHE_VERSION.to_string(),
            outputs,
        };
        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    /// Rebuilds from a snapshot. A version mismatch discards everything;
    /// entries with duplicate integer ids are logged and skipped.
    pub fn restore(&mut self, text: &str) {
        let snapshot: RegistrySnapshot = match serde_json::from_str(text) {
            Ok(s) => s,
            Err(err) => {
                warn!("discarding unreadable registry snapshot: {}", err);
                return;
            }
        };
        if snapshot.version != CACHE_VERSION {
            warn!(
                "registry version {} does not match {}; starting clean",
                snapshot.version, CACHE_VERSION
            );
            return;
        }
        for (key, out) in snapshot.outputs {
            let mut registry = OutputRegistry {
                last_id: out.last_id,
                free_ids: out.free_ids,
                retention: out.retention,
                ..Default::default()
            };
            let mut seen = HashSet::new();
            for module in out.modules {
                if !seen.insert(module.integer_id) {
                    warn!(
                        "registry corruption: duplicate id #{} at {}; entry skipped",
                        module.integer_id, module.apath
                    );
                    continue;
                }
                registry.taken_names.insert(module.var_name.clone());
                registry
                    .modules
                    .insert(module.apath.clone(), Arc::new(module));
            }
            self.outputs.insert(key, registry);
        }
    }

    pub fn load(&mut self, path: &Path) -> Result<()> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                self.restore(&text);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TsbError::Io(err)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = self.snapshot();
        trace!("writing registry snapshot to {}", path.display());
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Basename minus extension, or the parent directory's name for `index`
/// files.
fn base_name_for(apath: &str) -> String {
    let path = PathBuf::from(apath);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .trim_end_matches(".d")
        .to_string();
    if stem == "index" {
        if let Some(dir) = path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()) {
            return dir.to_string();
        }
    }
    stem
}

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Sanitizes to `[A-Za-z_$][A-Za-z0-9_$]*`; keywords get a `_` prefix,
/// empty becomes `_`, a leading digit is `_`-prefixed.
fn sanitize_var_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if JS_KEYWORDS.contains(&out.as_str()) {
        out.insert(0, '_');
    }
    out
}

/// Appends `2, 3, …` until the name is neither reserved nor taken.
fn allocate_var_name(base: &str, taken: &HashSet<String>) -> String {
    let base = sanitize_var_name(base);
    if !is_reserved(&base) && !taken.contains(&base) {
        return base;
    }
    let mut n: u32 = 2;
    loop {
        let candidate = format!("{}{}", base, n);
        if !is_reserved(&candidate) && !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize_var_name("my-module"), "my_module");
        assert_eq!(sanitize_var_name("2cool"), "_2cool");
        assert_eq!(sanitize_var_name(""), "_");
        assert_eq!(sanitize_var_name("class"), "_class");
        assert_eq!(sanitize_var_name("ok$name"), "ok$name");
    }

    #[test]
    fn base_name_uses_parent_for_index() {
        assert_eq!(base_name_for("/proj/src/lib/index.ts"), "lib");
        assert_eq!(base_name_for("/proj/src/a.ts"), "a");
        assert_eq!(base_name_for("/proj/src/types.d.ts"), "types");
    }

    #[test]
    fn allocates_distinct_suffixes() {
        let mut reg = IdRegistry::new();
        let a = reg.get_or_allocate("out", "/p/a.ts", ScriptKind::Ts);
        let a2 = reg.get_or_allocate("out", "/q/a.ts", ScriptKind::Ts);
        let a3 = reg.get_or_allocate("out", "/r/a.ts", ScriptKind::Ts);
        assert_eq!(a.var_name, "a");
        assert_eq!(a2.var_name, "a2");
        assert_eq!(a3.var_name, "a3");
        assert_eq!(a.integer_id, 1);
        assert_eq!(a2.integer_id, 2);
    }

    #[test]
    fn reserved_names_are_suffixed() {
        let mut reg = IdRegistry::new();
        let entry = reg.get_or_allocate("out", "/p/entry.ts", ScriptKind::Ts);
        assert_eq!(entry.var_name, "entry2");
        let req = reg.get_or_allocate("out", "/p/require.ts", ScriptKind::Ts);
        assert_eq!(req.var_name, "require2");
    }

    #[test]
    fn same_path_returns_same_id() {
        let mut reg = IdRegistry::new();
        let first = reg.get_or_allocate("out", "/p/a.ts", ScriptKind::Ts);
        let second = reg.get_or_allocate("out", "/p/a.ts", ScriptKind::Ts);
        assert_eq!(first.integer_id, second.integer_id);
        assert_eq!(first.var_name, second.var_name);
    }

    #[test]
    fn delete_recycles_ids() {
        let mut reg = IdRegistry::new();
        let a = reg.get_or_allocate("out", "/p/a.ts", ScriptKind::Ts);
        let freed = reg.delete("out", "/p/a.ts");
        assert_eq!(freed, Some(a.integer_id));
        let b = reg.get_or_allocate("out", "/p/b.ts", ScriptKind::Ts);
        assert_eq!(b.integer_id, a.integer_id);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut reg = IdRegistry::new();
        reg.get_or_allocate("out.js", "/p/a.ts", ScriptKind::Ts);
        reg.get_or_allocate("out.js", "/p/b.json", ScriptKind::Json);
        let text = reg.snapshot();

        let mut restored = IdRegistry::new();
        restored.restore(&text);
        let a = restored.get("out.js", "/p/a.ts").unwrap();
        assert_eq!(a.var_name, "a");
        let next = restored.get_or_allocate("out.js", "/p/c.ts", ScriptKind::Ts);
        assert_eq!(next.integer_id, 3);
    }

    #[test]
    fn version_mismatch_discards() {
        let mut reg = IdRegistry::new();
        reg.restore(r#"{"version":"tsbundle-cache-0","outputs":{"o":{"retention":9999999999999,"last_id":4,"free_ids":[],"modules":[]}}}"#);
        assert!(reg.get("o", "/p/a.ts").is_none());
        let id = reg.get_or_allocate("o", "/p/a.ts", ScriptKind::Ts);
        assert_eq!(id.integer_id, 1);
    }

    #[test]
    fn duplicate_ids_are_skipped() {
        let mut reg = IdRegistry::new();
        reg.get_or_allocate("o", "/p/a.ts", ScriptKind::Ts);
        reg.get_or_allocate("o", "/p/b.ts", ScriptKind::Ts);
        let mut text = reg.snapshot();
        // Forge b's id to collide with a's.
        text = text.replace("\"integer_id\":2", "\"integer_id\":1");
        let mut restored = IdRegistry::new();
        restored.restore(&text);
        assert!(restored.get("o", "/p/a.ts").is_some());
        assert!(restored.get("o", "/p/b.ts").is_none());
    }
}
