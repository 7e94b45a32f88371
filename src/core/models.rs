use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Language flavor of a source file, derived from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptKind {
    Ts,
    Tsx,
    Js,
    Jsx,
    Json,
    Dts,
    Unknown,
}

impl ScriptKind {
    /// `.d.ts` wins over `.ts`; everything else goes by extension.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if name.ends_with(".d.ts") || name.ends_with(".d.mts") || name.ends_with(".d.cts") {
            return ScriptKind::Dts;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("ts") | Some("mts") | Some("cts") => ScriptKind::Ts,
            Some("tsx") => ScriptKind::Tsx,
            Some("js") | Some("mjs") | Some("cjs") => ScriptKind::Js,
            Some("jsx") => ScriptKind::Jsx,
            Some("json") => ScriptKind::Json,
            _ => ScriptKind::Unknown,
        }
    }

    pub fn is_typescript(self) -> bool {
        matches!(self, ScriptKind::Ts | ScriptKind::Tsx | ScriptKind::Dts)
    }
}

/// Stable identity of one source file within one output's registry.
///
/// Created on first reference, persisted in the registry snapshot, never
/// mutated afterwards. Shared as `Arc<ModuleId>` between the registry, the
/// graph driver and cached artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleId {
    pub integer_id: u32,
    pub var_name: String,
    pub apath: String,
    pub kind: ScriptKind,
}

/// How an import leaves the bundle, if it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalMode {
    /// Bundle the module's source.
    NoExternal,
    /// Something else loads it (externals globs, suppressed resolutions).
    Manual,
    /// Emitted as a host-runtime `require` property in the registry.
    Preimport,
}

impl ExternalMode {
    pub fn to_code(self) -> u8 {
        match self {
            ExternalMode::NoExternal => 0,
            ExternalMode::Manual => 1,
            ExternalMode::Preimport => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ExternalMode::NoExternal),
            1 => Some(ExternalMode::Manual),
            2 => Some(ExternalMode::Preimport),
            _ => None,
        }
    }
}

/// Source position of an import specifier, for error reporting.
/// `line` and `column` are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPosition {
    pub line: u32,
    pub column: u32,
    pub width: u32,
    pub line_text: String,
}

impl ErrorPosition {
    pub fn from_offset(source: &str, offset: usize, width: usize) -> Self {
        let offset = offset.min(source.len());
        let before = &source[..offset];
        let line = before.bytes().filter(|b| *b == b'\n').count() as u32 + 1;
        let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let column = (offset - line_start) as u32 + 1;
        let line_end = source[line_start..]
            .find('\n')
            .map(|i| line_start + i)
            .unwrap_or(source.len());
        Self {
            line,
            column,
            width: width as u32,
            line_text: source[line_start..line_end].to_string(),
        }
    }
}

/// One resolved (or external) import recorded by refinement.
#[derive(Debug, Clone)]
pub struct ImportInfo {
    /// Resolved filesystem path; `None` for imports the bundle does not own.
    pub apath: Option<String>,
    /// The specifier as written, normalized.
    pub mpath: String,
    /// Whether the importer wants this child's declaration emitted.
    pub declaration: bool,
    pub external_mode: ExternalMode,
    pub pos: Option<ErrorPosition>,
}

impl ImportInfo {
    /// Wire form for the cache file: `[apath, mpath, declaration,
    /// external_mode, line?, column?, width?, line_text?]`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut arr = vec![
            match &self.apath {
                Some(p) => serde_json::Value::String(p.clone()),
                None => serde_json::Value::Null,
            },
            serde_json::Value::String(self.mpath.clone()),
            serde_json::Value::Bool(self.declaration),
            serde_json::Value::from(self.external_mode.to_code()),
        ];
        if let Some(pos) = &self.pos {
            arr.push(serde_json::Value::from(pos.line));
            arr.push(serde_json::Value::from(pos.column));
            arr.push(serde_json::Value::from(pos.width));
            arr.push(serde_json::Value::String(pos.line_text.clone()));
        }
        serde_json::Value::Array(arr)
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let arr = value.as_array()?;
        if arr.len() < 4 {
            return None;
        }
        let apath = match &arr[0] {
            serde_json::Value::String(s) => Some(s.clone()),
            _ => None,
        };
        let mpath = arr[1].as_str()?.to_string();
        let declaration = arr[2].as_bool()?;
        let external_mode = ExternalMode::from_code(arr[3].as_u64()? as u8)?;
        let pos = if arr.len() >= 8 {
            Some(ErrorPosition {
                line: arr[4].as_u64()? as u32,
                column: arr[5].as_u64()? as u32,
                width: arr[6].as_u64()? as u32,
                line_text: arr[7].as_str()?.to_string(),
            })
        } else {
            None
        };
        Some(Self {
            apath,
            mpath,
            declaration,
            external_mode,
            pos,
        })
    }
}

/// An import specifier split into the text as written and its normalized
/// module path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImportPath {
    pub raw: String,
    pub mpath: String,
}

impl ParsedImportPath {
    pub fn new(raw: &str) -> Self {
        // Drop query/hash suffixes some toolchains tolerate and trailing
        // slashes; keep the specifier otherwise as written.
        let mut mpath = raw.split(['?', '#']).next().unwrap_or(raw).to_string();
        while mpath.len() > 1 && mpath.ends_with('/') {
            mpath.pop();
        }
        Self {
            raw: raw.to_string(),
            mpath,
        }
    }

    pub fn is_relative(&self) -> bool {
        self.mpath.starts_with("./") || self.mpath.starts_with("../") || self.mpath == "."
    }
}

/// The cacheable artifact of one refined source file.
#[derive(Debug, Clone, Default)]
pub struct RefinedModule {
    pub imports: Vec<ImportInfo>,
    /// Wrapped body; the first line is `// <relative path>`.
    pub content: String,
    pub declaration: Option<String>,
    pub global_declaration: Option<String>,
    pub source_map_text: Option<String>,
    /// Wrapper lines emitted before the module body.
    pub source_map_output_line_offset: u32,
    /// Total lines this module contributes to the output.
    pub output_line_count: u32,
    /// Shebang preserved for the bundle prologue.
    pub first_line_comment: Option<String>,
    pub source_mtime: u64,
    pub dts_mtime: u64,
    pub tsconfig_mtime: u64,
    /// Refinement reported an error; never persisted.
    pub errored: bool,
    /// Approximate in-memory cost in bytes.
    pub size: usize,
}

impl RefinedModule {
    pub fn compute_size(&mut self) {
        self.size = self.content.len()
            + self.declaration.as_deref().map_or(0, str::len)
            + self.global_declaration.as_deref().map_or(0, str::len)
            + self.source_map_text.as_deref().map_or(0, str::len)
            + self.first_line_comment.as_deref().map_or(0, str::len)
            + self.imports.len() * 96;
    }
}

/// Shape of the emitted bundle's outer scope (`bundlerOptions.module`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExportRule {
    #[default]
    None,
    CommonJs,
    Es2015,
    /// `var|let|const NAME = (() => { ... })();`
    Var { decl: String, name: String },
    /// `<target>.<registry> = ...` where target is `this`/`window`/`self`.
    Direct { target: String },
}

impl ExportRule {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "none" => return Some(ExportRule::None),
            "commonjs" => return Some(ExportRule::CommonJs),
            "es2015" | "es6" => return Some(ExportRule::Es2015),
            "this" | "window" | "self" => {
                return Some(ExportRule::Direct {
                    target: value.to_string(),
                })
            }
            _ => {}
        }
        let mut parts = value.splitn(2, char::is_whitespace);
        let decl = parts.next()?;
        if matches!(decl, "var" | "let" | "const") {
            let name = parts.next()?.trim();
            if !name.is_empty() {
                return Some(ExportRule::Var {
                    decl: decl.to_string(),
                    name: name.to_string(),
                });
            }
        }
        None
    }
}

/// DFS coloring used by the circular-dependency pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    None,
    Entered,
    Checked,
}

/// Per-path working node of one bundle invocation. Owned exclusively by the
/// `Bundler`'s module map; children are path strings into that map, never
/// owning references.
#[derive(Debug)]
pub struct BundlerModule {
    pub id: Arc<ModuleId>,
    pub mpath: String,
    pub is_entry: bool,
    pub is_appended: bool,
    pub need_declaration: bool,
    pub check_state: CheckState,
    pub children: Vec<String>,
}

impl BundlerModule {
    pub fn new(id: Arc<ModuleId>, mpath: String) -> Self {
        Self {
            id,
            mpath,
            is_entry: false,
            is_appended: false,
            need_declaration: false,
            check_state: CheckState::None,
            children: Vec::new(),
        }
    }
}

/// Summary of one bundle run; also the cache telemetry hook for tests.
#[derive(Debug, Default, Clone)]
pub struct BundleStats {
    pub output_path: std::path::PathBuf,
    pub declaration_path: Option<std::path::PathBuf>,
    pub source_map_path: Option<std::path::PathBuf>,
    pub modules_written: usize,
    /// Modules refined from source this run (cache misses).
    pub refined_count: usize,
    /// Modules served from the memory or disk cache.
    pub cache_hit_count: usize,
    pub error_count: usize,
}
