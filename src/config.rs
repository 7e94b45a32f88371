use crate::core::models::ExportRule;
use crate::utils::{Logger, Result, TsbError};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "tsbundle.config.json";
pub const CACHE_DIR_NAME: &str = ".tsbundle-cache";
pub const DEFAULT_OUTPUT_TEMPLATE: &str = "[dirname]/[name].bundle.js";

/// Entry points as configured: one path, several, or a map from entry path
/// to an output path or a per-entry option object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntrySpec {
    Single(String),
    Many(Vec<String>),
    Map(BTreeMap<String, EntryTarget>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryTarget {
    Output(String),
    Options(EntryOptions),
}

/// Per-entry overrides inside an entry map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryOptions {
    pub output: Option<String>,
    pub bundler_options: Option<BundlerOptions>,
    pub compiler_options: Option<serde_json::Value>,
}

/// `bundlerOptions.bundleExternals`: a switch or a package whitelist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundleExternals {
    Enabled(bool),
    Whitelist(Vec<String>),
}

impl Default for BundleExternals {
    fn default() -> Self {
        BundleExternals::Enabled(false)
    }
}

impl BundleExternals {
    pub fn wants(&self, package: &str) -> bool {
        match self {
            BundleExternals::Enabled(on) => *on,
            BundleExternals::Whitelist(list) => list.iter().any(|p| p == package),
        }
    }
}

/// `bundlerOptions.cacheMemory`: a byte count or `N|NK|NM|NG|NT` text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ByteSize {
    Number(u64),
    Text(String),
}

impl ByteSize {
    pub fn bytes(&self) -> Result<usize> {
        match self {
            ByteSize::Number(n) => Ok(*n as usize),
            ByteSize::Text(text) => parse_byte_size(text),
        }
    }
}

pub fn parse_byte_size(text: &str) -> Result<usize> {
    let text = text.trim();
    let (digits, unit) = match text.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => text.split_at(i),
        None => (text, ""),
    };
    let value: usize = digits
        .parse()
        .map_err(|_| TsbError::config(format!("invalid byte size: {}", text)))?;
    let factor: usize = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        other => {
            return Err(TsbError::config(format!(
                "unknown byte-size unit '{}' in {}",
                other, text
            )))
        }
    };
    Ok(value * factor)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundlerOptions {
    /// Registry object identifier in the output.
    pub global_module_var_name: String,
    /// `none|commonjs|es2015|this|window|self|var NAME|let NAME|const NAME`.
    pub module: Option<String>,
    /// Emit only the registry, not a single-entry evaluation.
    pub export_lib: bool,
    pub bundle_externals: BundleExternals,
    /// Browser target: `__dirname` becomes `location.href` based.
    pub browser: bool,
    /// Glob patterns of module paths that must not be bundled.
    pub externals: Vec<String>,
    /// Module paths emitted as preimports in the prologue.
    pub preimport: Vec<String>,
    pub suppress_dynamic_import_errors: bool,
    pub suppress_module_not_found_errors: bool,
    pub check_circular_dependency: bool,
    pub verbose: bool,
    pub cache_memory: Option<ByteSize>,
    /// Debounce window for watch mode, in milliseconds.
    pub watch_waiting: Option<u64>,
    /// Assemble source maps in-process (always the case here; retained for
    /// config compatibility).
    pub no_source_map_worker: bool,
    pub wrap_begin: Option<String>,
    pub wrap_end: Option<String>,
    pub decl_wrap_begin: Option<String>,
    pub decl_wrap_end: Option<String>,
}

impl Default for BundlerOptions {
    fn default() -> Self {
        Self {
            global_module_var_name: "__tsb".to_string(),
            module: None,
            export_lib: false,
            bundle_externals: BundleExternals::default(),
            browser: false,
            externals: Vec::new(),
            preimport: Vec::new(),
            suppress_dynamic_import_errors: false,
            suppress_module_not_found_errors: false,
            check_circular_dependency: false,
            verbose: false,
            cache_memory: None,
            watch_waiting: None,
            no_source_map_worker: true,
            wrap_begin: None,
            wrap_end: None,
            decl_wrap_begin: None,
            decl_wrap_end: None,
        }
    }
}

/// `tsbundle.config.json` root document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TsbConfig {
    pub entry: Option<EntrySpec>,
    pub output: Option<String>,
    pub bundler_options: BundlerOptions,
    /// Forwarded to the compiler backend untouched.
    pub compiler_options: serde_json::Value,
}

impl TsbConfig {
    /// Loads the config file from the project root if present.
    pub fn load_from_dir(root: &Path) -> Result<Option<(Self, PathBuf)>> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let config: TsbConfig = serde_json::from_str(&text)
            .map_err(|e| TsbError::config(format!("failed to parse {}: {}", path.display(), e)))?;
        Logger::info(&format!("loaded {}", path.display()));
        Ok(Some((config, path)))
    }

    fn compiler_flag(&self, key: &str) -> bool {
        self.compiler_options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Where the assembled source map goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMapMode {
    None,
    File,
    Inline,
}

/// Fully resolved configuration for one entry → output pair.
#[derive(Debug, Clone)]
pub struct BundleTarget {
    pub entry: PathBuf,
    pub output: PathBuf,
    pub options: BundlerOptions,
    pub compiler_options: serde_json::Value,
    pub export_rule: ExportRule,
    pub declaration: bool,
    pub source_map: SourceMapMode,
    pub externals: GlobSet,
    /// mtime of the config file, part of cache validity.
    pub config_mtime: u64,
}

impl BundleTarget {
    fn resolve(
        root: &Path,
        entry: &str,
        output: Option<&str>,
        base: &TsbConfig,
        overrides: Option<&EntryOptions>,
        config_mtime: u64,
    ) -> Result<Self> {
        let entry_path = if Path::new(entry).is_absolute() {
            PathBuf::from(entry)
        } else {
            root.join(entry)
        };

        let options = overrides
            .and_then(|o| o.bundler_options.clone())
            .unwrap_or_else(|| base.bundler_options.clone());
        let compiler_options = overrides
            .and_then(|o| o.compiler_options.clone())
            .unwrap_or_else(|| base.compiler_options.clone());

        let template = overrides
            .and_then(|o| o.output.as_deref())
            .or(output)
            .or(base.output.as_deref())
            .unwrap_or(DEFAULT_OUTPUT_TEMPLATE);
        let expanded = expand_output_template(template, &entry_path)?;
        let output_path = if Path::new(&expanded).is_absolute() {
            PathBuf::from(expanded)
        } else {
            root.join(expanded)
        };

        let export_rule = match options.module.as_deref() {
            None => ExportRule::default(),
            Some(text) => ExportRule::parse(text).ok_or_else(|| {
                TsbError::config(format!("unrecognized bundlerOptions.module: {}", text))
            })?,
        };

        let mut externals = GlobSetBuilder::new();
        for pattern in &options.externals {
            let glob = Glob::new(pattern)
                .map_err(|e| TsbError::config(format!("bad externals glob {}: {}", pattern, e)))?;
            externals.add(glob);
        }
        let externals = externals
            .build()
            .map_err(|e| TsbError::config(format!("externals globs: {}", e)))?;

        let base_for_flags = TsbConfig {
            compiler_options: compiler_options.clone(),
            ..Default::default()
        };
        let declaration = base_for_flags.compiler_flag("declaration");
        let source_map = if base_for_flags.compiler_flag("inlineSourceMap") {
            SourceMapMode::Inline
        } else if base_for_flags.compiler_flag("sourceMap") {
            SourceMapMode::File
        } else {
            SourceMapMode::None
        };

        Ok(Self {
            entry: entry_path,
            output: output_path,
            options,
            compiler_options,
            export_rule,
            declaration,
            source_map,
            externals,
            config_mtime,
        })
    }
}

/// Expands `[name]`, `[dirname]` and `[ENVVAR]` in an output template.
pub fn expand_output_template(template: &str, entry: &Path) -> Result<String> {
    let name = entry
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("bundle");
    let dirname = match entry.parent().and_then(|p| p.to_str()) {
        None | Some("") => ".",
        Some(dir) => dir,
    };
    let mut out = String::new();
    let mut rest = template;
    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find(']') else {
            return Err(TsbError::config(format!(
                "unterminated [ in output template: {}",
                template
            )));
        };
        let key = &rest[open + 1..open + close];
        match key {
            "name" => out.push_str(name),
            "dirname" => out.push_str(dirname),
            env_key => match std::env::var(env_key) {
                Ok(value) => out.push_str(&value),
                Err(_) => {
                    return Err(TsbError::config(format!(
                        "environment variable {} is not set (output template {})",
                        env_key, template
                    )))
                }
            },
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Merges the config file with CLI arguments (CLI wins) and expands every
/// entry into a `BundleTarget`.
pub fn resolve_targets(
    root: &Path,
    config: &TsbConfig,
    config_path: Option<&Path>,
    cli_entries: &[String],
    cli_output: Option<&str>,
) -> Result<Vec<BundleTarget>> {
    let config_mtime = config_path
        .and_then(|p| std::fs::metadata(p).ok())
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut targets = Vec::new();
    if !cli_entries.is_empty() {
        for entry in cli_entries {
            targets.push(BundleTarget::resolve(
                root,
                entry,
                cli_output,
                config,
                None,
                config_mtime,
            )?);
        }
        return Ok(targets);
    }

    match &config.entry {
        None => Err(TsbError::config(
            "no entry point; pass one on the command line or set \"entry\"",
        )),
        Some(EntrySpec::Single(entry)) => {
            targets.push(BundleTarget::resolve(
                root,
                entry,
                cli_output,
                config,
                None,
                config_mtime,
            )?);
            Ok(targets)
        }
        Some(EntrySpec::Many(entries)) => {
            for entry in entries {
                targets.push(BundleTarget::resolve(
                    root,
                    entry,
                    cli_output,
                    config,
                    None,
                    config_mtime,
                )?);
            }
            Ok(targets)
        }
        Some(EntrySpec::Map(map)) => {
            for (entry, target) in map {
                let (output, overrides) = match target {
                    EntryTarget::Output(path) => (Some(path.as_str()), None),
                    EntryTarget::Options(options) => (None, Some(options)),
                };
                targets.push(BundleTarget::resolve(
                    root,
                    entry,
                    output.or(cli_output),
                    config,
                    overrides,
                    config_mtime,
                )?);
            }
            Ok(targets)
        }
    }
}
