use crate::config::BundleTarget;
use crate::context::MainContext;
use crate::core::interfaces::{
    Compiler, EsImportClause, ExportShape, ImportSyntax, ReexportShape, ScanOutput,
    SyntacticImport, VirtualSystem,
};
use crate::core::models::{
    ErrorPosition, ExternalMode, ImportInfo, ModuleId, ParsedImportPath, RefinedModule, ScriptKind,
};
use crate::infrastructure::file_system::{normalize_path, relative_path, SourceCache};
use crate::infrastructure::node_resolver::NodeModuleResolver;
use crate::utils::{js_string, require_call, Logger, Result, TsbError};
use once_cell::sync::Lazy;
use regex::Regex;
use sourcemap::SourceMapBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Declaration file whose imports are compile-time markers, recognized by
/// this exact suffix.
const REFLECT_MARKER_SUFFIX: &str = "/if-tsb/reflect.d.ts";

static USE_STRICT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*(?:"use strict"|'use strict');?\s*$"#).unwrap());
static ES_MODULE_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*Object\.defineProperty\(exports,\s*["']__esModule["']"#).unwrap()
});
static EXPORT_VOID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*exports\.[\w$]+(\s*=\s*exports\.[\w$]+)*\s*=\s*void 0;\s*$").unwrap()
});
static SOURCE_MAPPING_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^//#\s*sourceMappingURL\s*=.*\n?").unwrap());
static MODULE_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(^|[^.\w$])module\b").unwrap());
static DIRNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(^|[^.\w$])__dirname\b").unwrap());
static FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(^|[^.\w$])__filename\b").unwrap());
// The optional `{` group keeps `declare global { ... }` augmentations out.
static GLOBAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(^|[^.\w$])global\b(\s*\{)?").unwrap());
static IMPORT_META_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bimport\s*\.\s*meta\s*\.\s*url\b").unwrap());
static DECLARE_MODIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\s*)(export\s+)?declare\s+").unwrap());

/// What to schedule and how to wire one module's refinement.
#[derive(Debug, Clone)]
pub struct RefineInput {
    pub id: Arc<ModuleId>,
    pub is_entry: bool,
    pub need_declaration: bool,
}

#[derive(Debug)]
pub struct RefineOutcome {
    /// `None` means the source itself was unreadable; the driver emits a
    /// throwing stub in its place.
    pub refined: Option<Arc<RefinedModule>>,
    pub from_cache: bool,
}

struct Splice {
    start: usize,
    end: usize,
    text: String,
}

fn apply_splices(source: &str, mut splices: Vec<Splice>) -> String {
    splices.sort_by_key(|s| s.start);
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for splice in splices {
        if splice.start < cursor {
            // Overlap; first splice wins.
            continue;
        }
        out.push_str(&source[cursor..splice.start]);
        out.push_str(&splice.text);
        cursor = splice.end;
    }
    out.push_str(&source[cursor..]);
    out
}

fn to_slash(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

/// Converts one source file into its cacheable `RefinedModule`.
pub struct Refiner {
    compiler: Arc<dyn Compiler>,
    resolver: Arc<NodeModuleResolver>,
    system: Arc<dyn VirtualSystem>,
    sources: Arc<SourceCache>,
    target: Arc<BundleTarget>,
    ctx: Arc<MainContext>,
    output_key: String,
    output_dir: PathBuf,
}

impl Refiner {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        resolver: Arc<NodeModuleResolver>,
        system: Arc<dyn VirtualSystem>,
        sources: Arc<SourceCache>,
        target: Arc<BundleTarget>,
        ctx: Arc<MainContext>,
    ) -> Self {
        let output_dir = target
            .output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let output_key = to_slash(&target.output);
        Self {
            compiler,
            resolver,
            system,
            sources,
            target,
            ctx,
            output_key,
            output_dir,
        }
    }

    fn global_var(&self) -> &str {
        &self.target.options.global_module_var_name
    }

    fn rpath_of(&self, apath: &Path) -> String {
        to_slash(&relative_path(&self.output_dir, apath))
    }

    fn dts_sibling(&self, apath: &Path, kind: ScriptKind) -> Option<PathBuf> {
        if !matches!(kind, ScriptKind::Ts | ScriptKind::Tsx) {
            return None;
        }
        let text = apath.to_str()?;
        let stem = text
            .strip_suffix(".tsx")
            .or_else(|| text.strip_suffix(".ts"))?;
        Some(PathBuf::from(format!("{}.d.ts", stem)))
    }

    /// Cache probe then fresh refinement; the single entry point per module.
    pub async fn refine(&self, input: RefineInput) -> Result<RefineOutcome> {
        let apath = PathBuf::from(&input.id.apath);
        let rpath = self.rpath_of(&apath);

        let Some(source_mtime) = self.system.mtime(&apath).await else {
            self.ctx.report(&TsbError::ModuleNotFound {
                mpath: rpath.clone(),
                importer: rpath,
                pos: None,
            });
            return Ok(RefineOutcome {
                refined: None,
                from_cache: false,
            });
        };

        let dts_path = self.dts_sibling(&apath, input.id.kind);
        let dts_mtime = match (&dts_path, input.need_declaration) {
            (Some(path), true) => self.system.mtime(path).await,
            _ => None,
        };

        let can_have_declaration = dts_mtime.is_some()
            || matches!(input.id.kind, ScriptKind::Json | ScriptKind::Dts);
        let declaration_satisfied = |module: &RefinedModule| {
            !input.need_declaration || module.declaration.is_some() || !can_have_declaration
        };

        // Memory cache first.
        let memory_hit = self
            .ctx
            .memory_cache()
            .lock()
            .take(input.id.integer_id);
        if let Some(cached) = memory_hit {
            if cached.source_mtime == source_mtime
                && cached.tsconfig_mtime == self.target.config_mtime
                && declaration_satisfied(&cached)
            {
                Logger::module_refined(&self.rpath_of(&apath), true);
                return Ok(RefineOutcome {
                    refined: Some(cached),
                    from_cache: true,
                });
            }
            let mut memory = self.ctx.memory_cache().lock();
            memory.release(input.id.integer_id);
            memory.expire(input.id.integer_id);
        }

        // Disk cache next.
        let validity = crate::cache::CacheValidity {
            rpath: &rpath,
            source_mtime,
            tsconfig_mtime: self.target.config_mtime,
            dts_mtime,
        };
        if let Some(cached) = self
            .ctx
            .disk_cache()
            .load(input.id.integer_id, &validity)
            .await
        {
            if declaration_satisfied(&cached) {
                let cached = Arc::new(cached);
                self.ctx
                    .memory_cache()
                    .lock()
                    .register(input.id.integer_id, cached.clone());
                Logger::module_refined(&rpath, true);
                return Ok(RefineOutcome {
                    refined: Some(cached),
                    from_cache: true,
                });
            }
        }

        // Fresh refinement.
        let refined = match self
            .refine_fresh(&input, &apath, &rpath, source_mtime, dts_path, dts_mtime)
            .await?
        {
            Some(refined) => refined,
            None => {
                return Ok(RefineOutcome {
                    refined: None,
                    from_cache: false,
                })
            }
        };

        let refined = Arc::new(refined);
        if !refined.errored {
            if let Err(err) = self
                .ctx
                .disk_cache()
                .store(input.id.integer_id, &refined)
                .await
            {
                self.ctx
                    .report(&TsbError::cache(format!("cache write for {}: {}", rpath, err)));
            }
            self.ctx
                .memory_cache()
                .lock()
                .register(input.id.integer_id, refined.clone());
        }
        Logger::module_refined(&rpath, false);
        Ok(RefineOutcome {
            refined: Some(refined),
            from_cache: false,
        })
    }

    async fn refine_fresh(
        &self,
        input: &RefineInput,
        apath: &Path,
        rpath: &str,
        source_mtime: u64,
        dts_path: Option<PathBuf>,
        dts_mtime: Option<u64>,
    ) -> Result<Option<RefinedModule>> {
        let (source, _) = match self.sources.get(apath).await {
            Ok(found) => found,
            Err(err) => {
                self.ctx
                    .report(&TsbError::cache(format!("cannot read {}: {}", rpath, err)));
                return Ok(None);
            }
        };

        let mut refined = if input.id.kind == ScriptKind::Json {
            self.refine_json(input, rpath, &source)
        } else {
            self.refine_code(input, apath, rpath, &source).await?
        };

        refined.source_mtime = source_mtime;
        refined.tsconfig_mtime = self.target.config_mtime;
        refined.dts_mtime = dts_mtime.unwrap_or(0);

        if input.need_declaration && refined.declaration.is_none() && !refined.errored {
            let dts_source = match (input.id.kind, &dts_path) {
                (ScriptKind::Dts, _) => Some((apath.to_path_buf(), source.clone())),
                (_, Some(path)) => self
                    .sources
                    .get(path)
                    .await
                    .ok()
                    .map(|(text, _)| (path.clone(), text)),
                _ => None,
            };
            if let Some((path, text)) = dts_source {
                let (declaration, global, extra) =
                    self.transform_declaration(&path, &text).await;
                refined.declaration = Some(declaration);
                refined.global_declaration = global;
                merge_declaration_imports(&mut refined.imports, extra);
            }
        }

        refined.compute_size();
        Ok(Some(refined))
    }

    fn refine_json(&self, input: &RefineInput, rpath: &str, source: &str) -> RefinedModule {
        let gv = self.global_var();
        match serde_json::from_str::<serde_json::Value>(source) {
            Ok(_) => {
                let body = format!("module.exports = {};", source.trim());
                let (content, offset, line_count) =
                    wrap_module(rpath, &input.id.var_name, gv, &body, true);
                RefinedModule {
                    declaration: if input.need_declaration {
                        Some(format!(
                            "export const {}: {};",
                            input.id.var_name,
                            source.trim()
                        ))
                    } else {
                        None
                    },
                    content,
                    source_map_output_line_offset: offset,
                    output_line_count: line_count,
                    ..Default::default()
                }
            }
            Err(err) => {
                self.ctx.report(&TsbError::JsError {
                    message: format!("invalid JSON: {}", err),
                    importer: rpath.to_string(),
                });
                self.errored_module(input, rpath)
            }
        }
    }

    fn errored_module(&self, input: &RefineInput, rpath: &str) -> RefinedModule {
        let body = format!("throw Error({});", js_string(&format!("Cannot compile '{}'", rpath)));
        let (content, offset, line_count) =
            wrap_module(rpath, &input.id.var_name, self.global_var(), &body, false);
        RefinedModule {
            content,
            source_map_output_line_offset: offset,
            output_line_count: line_count,
            errored: true,
            ..Default::default()
        }
    }

    async fn refine_code(
        &self,
        input: &RefineInput,
        apath: &Path,
        rpath: &str,
        source: &Arc<String>,
    ) -> Result<RefinedModule> {
        let mut errored = false;

        // Shebang is captured before anything parses the text.
        let (first_line_comment, source_text) = match source.strip_prefix("#!") {
            Some(rest) => {
                let line_end = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
                (
                    Some(format!("#!{}", rest[..line_end].trim_end())),
                    &rest[line_end..],
                )
            }
            None => (None, source.as_str()),
        };

        let scan = match self.compiler.scan(source_text, input.id.kind) {
            Ok(scan) => scan,
            Err(err) => {
                self.ctx.report(&TsbError::JsError {
                    message: err.to_string(),
                    importer: rpath.to_string(),
                });
                return Ok(self.errored_module(input, rpath));
            }
        };

        for diagnostic in &scan.diagnostics {
            self.ctx.report(&TsbError::JsError {
                message: diagnostic.message.clone(),
                importer: rpath.to_string(),
            });
            errored = true;
        }
        if errored {
            // A broken parse makes every recorded span suspect.
            return Ok(self.errored_module(input, rpath));
        }

        for offset in &scan.non_literal_dynamic_imports {
            if self.target.options.suppress_dynamic_import_errors {
                continue;
            }
            let pos = ErrorPosition::from_offset(source_text, *offset, 6);
            self.ctx.report(&TsbError::Unsupported {
                message: "dynamic import argument must be a string literal".to_string(),
                importer: rpath.to_string(),
                pos: Some(pos),
            });
            errored = true;
        }

        let classified = self
            .classify_imports(input, apath, rpath, source_text, &scan)
            .await;
        let mut splices = classified.splices;
        let mut imports = classified.imports;
        errored |= classified.errored;

        // Export lowering: strip modifiers in place, assign at the tail.
        let mut tail = Vec::new();
        for export in &scan.exports {
            match &export.shape {
                ExportShape::Declaration { names } => {
                    splices.push(Splice {
                        start: export.span.0,
                        end: export.span.1,
                        text: String::new(),
                    });
                    for name in names {
                        tail.push(format!("exports.{} = {};", name, name));
                    }
                }
                ExportShape::Default => {
                    splices.push(Splice {
                        start: export.span.0,
                        end: export.span.1,
                        text: "exports.default = ".to_string(),
                    });
                }
                ExportShape::List { names } => {
                    splices.push(Splice {
                        start: export.span.0,
                        end: export.span.1,
                        text: String::new(),
                    });
                    for binding in names {
                        tail.push(format!("exports.{} = {};", binding.local, binding.imported));
                    }
                }
            }
        }

        let mut body = apply_splices(source_text, splices);
        if scan.has_es_exports() {
            body = format!("exports.__esModule = true;\n{}", body);
        }
        if !tail.is_empty() {
            body = format!("{}\n{}", body.trim_end(), tail.join("\n"));
        }

        // Marker-call expansion.
        if !classified.import_raw_names.is_empty() {
            match self
                .expand_import_raw(&classified.import_raw_names, &body, apath, rpath)
                .await
            {
                Ok(expanded) => body = expanded,
                Err(()) => errored = true,
            }
        }
        for name in &classified.reflect_names {
            let pattern = Regex::new(&format!(r"\b{}\s*[<(]", regex::escape(name))).unwrap();
            if let Some(found) = pattern.find(&body) {
                let pos = ErrorPosition::from_offset(&body, found.start(), name.len());
                self.ctx.report(&TsbError::WrongUsage {
                    message: format!(
                        "{}() expands through a reflecter module at compile time, which this \
                         backend cannot execute",
                        name
                    ),
                    importer: rpath.to_string(),
                    pos: Some(pos),
                });
                errored = true;
            }
        }

        body = self.rewrite_specials(&body, rpath);

        // Lower TS/JSX after rewriting; the splices are plain JS already.
        let emitted = if matches!(
            input.id.kind,
            ScriptKind::Ts | ScriptKind::Tsx | ScriptKind::Jsx
        ) {
            match self.compiler.emit(&body, input.id.kind) {
                Ok(emitted) => emitted,
                Err(err) => {
                    self.ctx.report(&TsbError::JsError {
                        message: err.to_string(),
                        importer: rpath.to_string(),
                    });
                    return Ok(self.errored_module(input, rpath));
                }
            }
        } else if input.id.kind == ScriptKind::Dts {
            String::new()
        } else {
            body
        };

        let stripped = strip_boilerplate(&emitted);
        let uses_module = MODULE_REF_RE.is_match(&stripped);
        let (content, offset, line_count) = wrap_module(
            rpath,
            &input.id.var_name,
            self.global_var(),
            &stripped,
            uses_module,
        );

        let body_lines = line_count - offset - 2;
        let source_map_text = if self.target.source_map != crate::config::SourceMapMode::None
            && !errored
            && body_lines > 0
        {
            match build_line_map(&to_slash(apath), body_lines, source_text.lines().count() as u32)
            {
                Some(map) => Some(map),
                None => {
                    Logger::warn(&format!("source map generation failed for {}", rpath));
                    None
                }
            }
        } else {
            None
        };

        // Repeat imports collapse to the first occurrence; source order is
        // preserved for the prologue's preimport insertion order.
        let mut seen = std::collections::HashSet::new();
        imports.retain(|i| seen.insert((i.mpath.clone(), i.apath.clone())));

        Ok(RefinedModule {
            imports,
            content,
            source_map_text,
            source_map_output_line_offset: offset,
            output_line_count: line_count,
            first_line_comment,
            errored,
            ..Default::default()
        })
    }

    fn rewrite_specials(&self, body: &str, rpath: &str) -> String {
        let gv = self.global_var();
        let rdir = match rpath.rfind('/') {
            Some(i) => &rpath[..i],
            None => ".",
        };
        let mut out = body.to_string();
        if IMPORT_META_URL_RE.is_match(&out) {
            let replacement = if self.target.options.browser {
                format!("new URL({}, location.href).href", js_string(rpath))
            } else {
                format!(
                    "require(\"url\").pathToFileURL({}.__resolve({})).href",
                    gv,
                    js_string(rpath)
                )
            };
            out = IMPORT_META_URL_RE
                .replace_all(&out, |_: &regex::Captures| replacement.clone())
                .into_owned();
        }
        if DIRNAME_RE.is_match(&out) {
            let replacement = format!("{}.__resolve({})", gv, js_string(rdir));
            out = DIRNAME_RE
                .replace_all(&out, |caps: &regex::Captures| {
                    format!("{}{}", &caps[1], replacement)
                })
                .into_owned();
        }
        if FILENAME_RE.is_match(&out) {
            let replacement = format!("{}.__resolve({})", gv, js_string(rpath));
            out = FILENAME_RE
                .replace_all(&out, |caps: &regex::Captures| {
                    format!("{}{}", &caps[1], replacement)
                })
                .into_owned();
        }
        out = GLOBAL_RE
            .replace_all(&out, |caps: &regex::Captures| {
                if caps.get(2).is_some() {
                    caps[0].to_string()
                } else {
                    format!("{}globalThis", &caps[1])
                }
            })
            .into_owned();
        out
    }

    async fn expand_import_raw(
        &self,
        names: &[String],
        body: &str,
        apath: &Path,
        rpath: &str,
    ) -> std::result::Result<String, ()> {
        let dir = apath.parent().unwrap_or_else(|| Path::new("."));
        let mut splices = Vec::new();
        let mut failed = false;
        for name in names {
            let pattern = Regex::new(&format!(
                r#"\b{}\s*(?:<[^<>]*>)?\s*\(\s*(['"])([^'"]+)['"]\s*\)"#,
                regex::escape(name)
            ))
            .unwrap();
            for capture in pattern.captures_iter(body) {
                let whole = capture.get(0).unwrap();
                let raw_path = capture.get(2).unwrap().as_str();
                let file = normalize_path(&dir.join(raw_path));
                match self.system.read(&file).await {
                    Ok(contents) => splices.push(Splice {
                        start: whole.start(),
                        end: whole.end(),
                        text: js_string(&contents),
                    }),
                    Err(_) => {
                        let pos = ErrorPosition::from_offset(body, whole.start(), whole.len());
                        self.ctx.report(&TsbError::WrongUsage {
                            message: format!("{}: cannot read '{}'", name, raw_path),
                            importer: rpath.to_string(),
                            pos: Some(pos),
                        });
                        failed = true;
                    }
                }
            }
        }
        if failed {
            return Err(());
        }
        Ok(apply_splices(body, splices))
    }

    async fn classify_imports(
        &self,
        input: &RefineInput,
        apath: &Path,
        rpath: &str,
        source: &str,
        scan: &ScanOutput,
    ) -> ClassifiedImports {
        let gv = self.global_var().to_string();
        let mut out = ClassifiedImports::default();

        for imp in &scan.imports {
            if imp.type_only {
                out.splices.push(Splice {
                    start: imp.span.0,
                    end: imp.span.1,
                    text: String::new(),
                });
                continue;
            }

            let parsed = ParsedImportPath::new(&imp.specifier);
            let pos = ErrorPosition::from_offset(source, imp.specifier_span.0, parsed.raw.len());

            // Externals globs always win.
            if self.target.externals.is_match(&parsed.mpath) {
                self.splice_external(&mut out, imp, &parsed, &gv);
                out.imports.push(ImportInfo {
                    apath: None,
                    mpath: parsed.mpath,
                    declaration: false,
                    external_mode: ExternalMode::Manual,
                    pos: Some(pos),
                });
                continue;
            }

            if parsed.is_relative() || parsed.mpath.starts_with('/') {
                match self.resolver.resolve(&parsed.mpath, apath).await {
                    Some(resolution) => {
                        let resolved = to_slash(&resolution.path);
                        if resolved.ends_with(REFLECT_MARKER_SUFFIX) {
                            self.record_marker(&mut out, imp);
                            continue;
                        }
                        self.splice_bundled(&mut out, imp, &resolved, &gv, input, pos);
                    }
                    None => self.handle_not_found(&mut out, imp, &parsed, rpath, pos, &gv),
                }
                continue;
            }

            // Bare specifier.
            if parsed.mpath == "if-tsb/reflect" || parsed.mpath.ends_with("/if-tsb/reflect") {
                self.record_marker(&mut out, imp);
                continue;
            }
            if self.target.options.preimport.iter().any(|p| *p == parsed.mpath) {
                self.splice_preimport(&mut out, imp, &parsed, &gv, pos);
                continue;
            }
            match self.resolver.resolve(&parsed.mpath, apath).await {
                Some(resolution) => {
                    let resolved = to_slash(&resolution.path);
                    if resolved.ends_with(REFLECT_MARKER_SUFFIX) {
                        self.record_marker(&mut out, imp);
                        continue;
                    }
                    let bundle_it = resolution
                        .package
                        .as_deref()
                        .map(|pkg| self.target.options.bundle_externals.wants(pkg))
                        .unwrap_or(true);
                    if bundle_it {
                        self.splice_bundled(&mut out, imp, &resolved, &gv, input, pos);
                    } else {
                        self.splice_preimport(&mut out, imp, &parsed, &gv, pos);
                    }
                }
                // Unresolvable bare names (node builtins among them) defer
                // to the host runtime's loader.
                None => self.splice_preimport(&mut out, imp, &parsed, &gv, pos),
            }
        }
        out
    }

    fn record_marker(&self, out: &mut ClassifiedImports, imp: &SyntacticImport) {
        out.splices.push(Splice {
            start: imp.span.0,
            end: imp.span.1,
            text: String::new(),
        });
        if let Some(clause) = &imp.clause {
            for binding in &clause.named {
                match binding.imported.as_str() {
                    "reflect" => out.reflect_names.push(binding.local.clone()),
                    "importRaw" => out.import_raw_names.push(binding.local.clone()),
                    _ => {}
                }
            }
        }
    }

    fn splice_bundled(
        &self,
        out: &mut ClassifiedImports,
        imp: &SyntacticImport,
        resolved: &str,
        gv: &str,
        input: &RefineInput,
        pos: ErrorPosition,
    ) {
        let kind = ScriptKind::from_path(Path::new(resolved));
        let child = self.ctx.module_id(&self.output_key, resolved, kind);
        let expr = format!("{}.{}()", gv, child.var_name);
        out.splices.push(Splice {
            start: imp.span.0,
            end: imp.span.1,
            text: import_replacement(imp, &expr, gv),
        });
        out.imports.push(ImportInfo {
            apath: Some(resolved.to_string()),
            mpath: ParsedImportPath::new(&imp.specifier).mpath,
            declaration: input.need_declaration,
            external_mode: ExternalMode::NoExternal,
            pos: Some(pos),
        });
    }

    fn splice_preimport(
        &self,
        out: &mut ClassifiedImports,
        imp: &SyntacticImport,
        parsed: &ParsedImportPath,
        gv: &str,
        pos: ErrorPosition,
    ) {
        let pre = self
            .ctx
            .module_id(&self.output_key, &parsed.mpath, ScriptKind::Unknown);
        let expr = format!("{}.{}", gv, pre.var_name);
        out.splices.push(Splice {
            start: imp.span.0,
            end: imp.span.1,
            text: import_replacement(imp, &expr, gv),
        });
        out.imports.push(ImportInfo {
            apath: None,
            mpath: parsed.mpath.clone(),
            declaration: false,
            external_mode: ExternalMode::Preimport,
            pos: Some(pos),
        });
    }

    /// Externals stay on the host loader: call forms are left untouched,
    /// ES forms become a plain `require` at the site.
    fn splice_external(
        &self,
        out: &mut ClassifiedImports,
        imp: &SyntacticImport,
        parsed: &ParsedImportPath,
        gv: &str,
    ) {
        match imp.syntax {
            ImportSyntax::Require | ImportSyntax::DynamicImport => {}
            _ => {
                let expr = require_call(&parsed.raw);
                out.splices.push(Splice {
                    start: imp.span.0,
                    end: imp.span.1,
                    text: import_replacement(imp, &expr, gv),
                });
            }
        }
    }

    fn handle_not_found(
        &self,
        out: &mut ClassifiedImports,
        imp: &SyntacticImport,
        parsed: &ParsedImportPath,
        rpath: &str,
        pos: ErrorPosition,
        gv: &str,
    ) {
        let err = TsbError::ModuleNotFound {
            mpath: parsed.mpath.clone(),
            importer: rpath.to_string(),
            pos: Some(pos.clone()),
        };
        if self.target.options.suppress_module_not_found_errors {
            Logger::warn(&err.report());
            self.splice_external(out, imp, parsed, gv);
            out.imports.push(ImportInfo {
                apath: None,
                mpath: parsed.mpath.clone(),
                declaration: false,
                external_mode: ExternalMode::Manual,
                pos: Some(pos),
            });
        } else {
            self.ctx.report(&err);
            out.errored = true;
        }
    }

    /// Rewrites a `.d.ts` body into namespace-member form: imports become
    /// qualified-name references, `declare module`/`declare global` blocks
    /// move to the global declaration.
    async fn transform_declaration(
        &self,
        dts_path: &Path,
        text: &str,
    ) -> (String, Option<String>, Vec<ImportInfo>) {
        let gv = self.global_var();
        let mut imports = Vec::new();
        let mut renames: Vec<(String, String)> = Vec::new();
        let mut splices = Vec::new();

        if let Ok(scan) = self.compiler.scan(text, ScriptKind::Dts) {
            for imp in &scan.imports {
                let parsed = ParsedImportPath::new(&imp.specifier);
                let resolved = if parsed.is_relative() {
                    self.resolver.resolve(&parsed.mpath, dts_path).await
                } else {
                    None
                };
                let Some(resolution) = resolved else {
                    // External types keep their names.
                    splices.push(Splice {
                        start: imp.span.0,
                        end: imp.span.1,
                        text: String::new(),
                    });
                    continue;
                };
                let resolved = to_slash(&resolution.path);
                if resolved.ends_with(REFLECT_MARKER_SUFFIX) {
                    splices.push(Splice {
                        start: imp.span.0,
                        end: imp.span.1,
                        text: String::new(),
                    });
                    continue;
                }
                let kind = ScriptKind::from_path(Path::new(&resolved));
                let child = self.ctx.module_id(&self.output_key, &resolved, kind);
                let qualified = format!("{}.{}", gv, child.var_name);
                match imp.syntax {
                    ImportSyntax::DynamicImport => {
                        // `import('m').T` becomes a qualified-name chain.
                        splices.push(Splice {
                            start: imp.span.0,
                            end: imp.span.1,
                            text: qualified.clone(),
                        });
                    }
                    _ => {
                        splices.push(Splice {
                            start: imp.span.0,
                            end: imp.span.1,
                            text: match &imp.reexport {
                                Some(ReexportShape::Named(names)) => names
                                    .iter()
                                    .map(|b| {
                                        format!(
                                            "export import {} = {}.{};",
                                            b.local, qualified, b.imported
                                        )
                                    })
                                    .collect::<Vec<_>>()
                                    .join("\n"),
                                Some(ReexportShape::Star) => String::new(),
                                None => String::new(),
                            },
                        });
                        if let Some(clause) = &imp.clause {
                            if let Some(namespace) = &clause.namespace {
                                renames.push((namespace.clone(), qualified.clone()));
                            }
                            if let Some(default) = &clause.default {
                                renames.push((default.clone(), format!("{}.default", qualified)));
                            }
                            for binding in &clause.named {
                                renames.push((
                                    binding.local.clone(),
                                    format!("{}.{}", qualified, binding.imported),
                                ));
                            }
                        }
                        if let Some(name) = &imp.equals_name {
                            renames.push((name.clone(), qualified.clone()));
                        }
                    }
                }
                imports.push(ImportInfo {
                    apath: Some(resolved),
                    mpath: parsed.mpath,
                    declaration: true,
                    external_mode: ExternalMode::NoExternal,
                    pos: None,
                });
            }
        }

        let mut body = apply_splices(text, splices);
        let mut global = String::new();
        for keyword in ["declare module", "declare global"] {
            while let Some(block) = extract_block(&body, keyword) {
                global.push_str(&body[block.0..block.1]);
                global.push('\n');
                body.replace_range(block.0..block.1, "");
            }
        }
        body = DECLARE_MODIFIER_RE.replace_all(&body, "$1$2").into_owned();
        body = body.replace("export default", "export");
        for (local, qualified) in &renames {
            let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(local))).unwrap();
            body = pattern.replace_all(&body, qualified.as_str()).into_owned();
        }
        let global = {
            let trimmed = global.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };
        (body.trim().to_string(), global, imports)
    }
}

#[derive(Default)]
struct ClassifiedImports {
    splices: Vec<Splice>,
    imports: Vec<ImportInfo>,
    reflect_names: Vec<String>,
    import_raw_names: Vec<String>,
    errored: bool,
}

/// Finds `<keyword> ... { ... }` with balanced braces; returns the byte
/// range of the whole block.
fn extract_block(text: &str, keyword: &str) -> Option<(usize, usize)> {
    let start = text.find(keyword)?;
    let open = start + text[start..].find('{')?;
    let mut depth = 0usize;
    for (i, b) in text[open..].bytes().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, open + i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

fn merge_declaration_imports(imports: &mut Vec<ImportInfo>, extra: Vec<ImportInfo>) {
    for info in extra {
        if let Some(existing) = imports
            .iter_mut()
            .find(|i| i.apath == info.apath && i.apath.is_some())
        {
            existing.declaration = true;
        } else {
            imports.push(info);
        }
    }
}

/// Builds the statement (or expression) that replaces one import form.
/// `expr` evaluates to the child's exports.
fn import_replacement(imp: &SyntacticImport, expr: &str, gv: &str) -> String {
    match imp.syntax {
        ImportSyntax::Require => expr.to_string(),
        ImportSyntax::DynamicImport => format!("Promise.resolve({})", expr),
        ImportSyntax::ImportEquals => {
            format!("const {} = {};", imp.equals_name.as_deref().unwrap_or("_"), expr)
        }
        ImportSyntax::ExportFrom => match &imp.reexport {
            Some(ReexportShape::Star) => format!("Object.assign(exports, {});", expr),
            Some(ReexportShape::Named(names)) => {
                let assigns = names
                    .iter()
                    .map(|b| format!("exports.{} = __m.{};", b.local, b.imported))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{{ const __m = {}; {} }}", expr, assigns)
            }
            None => format!("{};", expr),
        },
        ImportSyntax::EsImport => {
            let clause = imp.clause.clone().unwrap_or_default();
            let mut parts = Vec::new();
            if let Some(default) = &clause.default {
                parts.push(format!("{} = {}.__d({})", default, gv, expr));
            }
            if let Some(namespace) = &clause.namespace {
                parts.push(format!("{} = {}", namespace, expr));
            }
            if !clause.named.is_empty() {
                let list = clause
                    .named
                    .iter()
                    .map(|b| {
                        if b.imported == b.local {
                            b.imported.clone()
                        } else {
                            format!("{}: {}", b.imported, b.local)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                parts.push(format!("{{{}}} = {}", list, expr));
            }
            if parts.is_empty() {
                format!("{};", expr)
            } else {
                format!("const {};", parts.join(", "))
            }
        }
    }
}

/// Strips the emit boilerplate the bundle re-creates at its own level.
fn strip_boilerplate(emitted: &str) -> String {
    let without_map = SOURCE_MAPPING_URL_RE.replace_all(emitted, "");
    let mut out = Vec::new();
    let mut strict_stripped = false;
    for line in without_map.lines() {
        if !strict_stripped && USE_STRICT_RE.is_match(line) {
            strict_stripped = true;
            continue;
        }
        if ES_MODULE_MARKER_RE.is_match(line) || EXPORT_VOID_RE.is_match(line) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    while out.first().is_some_and(|l| l.trim().is_empty()) {
        out.remove(0);
    }
    out.join("\n")
}

/// Emits the registry-method wrapper around a module body and accounts for
/// its lines. Every module, the entry included, is a memoized thunk.
fn wrap_module(
    rpath: &str,
    var_name: &str,
    gv: &str,
    body: &str,
    uses_module: bool,
) -> (String, u32, u32) {
    let body = body.trim_end();
    let mut content = String::new();
    content.push_str(&format!("// {}\n", rpath));
    content.push_str(&format!("{}(){{\n", var_name));
    content.push_str(&format!(
        "if ({gv}.{v}.exports != null) return {gv}.{v}.exports;\n",
        gv = gv,
        v = var_name
    ));
    content.push_str(&format!(
        "const exports = {}.{}.exports = {{}};\n",
        gv, var_name
    ));
    let mut offset = 4u32;
    if uses_module {
        content.push_str("const module = {exports};\n");
        offset += 1;
    }
    let body_lines = if body.trim().is_empty() {
        0
    } else {
        content.push_str(body);
        content.push('\n');
        body.lines().count() as u32
    };
    if uses_module {
        content.push_str(&format!(
            "return {}.{}.exports = module.exports;\n",
            gv, var_name
        ));
    } else {
        content.push_str("return exports;\n");
    }
    content.push_str("},");
    (content, offset, offset + body_lines + 2)
}

/// Per-module line-identity map; the assembler re-bases generated lines.
fn build_line_map(source_path: &str, body_lines: u32, source_lines: u32) -> Option<String> {
    let mut builder = SourceMapBuilder::new(None);
    let source_id = builder.add_source(source_path);
    let last_source_line = source_lines.saturating_sub(1);
    for line in 0..body_lines {
        builder.add_raw(line, 0, line.min(last_source_line), 0, Some(source_id), None, false);
    }
    let map = builder.into_sourcemap();
    let mut buffer = Vec::new();
    map.to_writer(&mut buffer).ok()?;
    String::from_utf8(buffer).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::interfaces::NamedBinding;

    fn es_import(span: (usize, usize), specifier: &str, clause: EsImportClause) -> SyntacticImport {
        SyntacticImport {
            span,
            specifier: specifier.to_string(),
            specifier_span: span,
            syntax: ImportSyntax::EsImport,
            clause: Some(clause),
            equals_name: None,
            reexport: None,
            type_only: false,
        }
    }

    #[test]
    fn replacement_for_default_import() {
        let imp = es_import(
            (0, 10),
            "./a",
            EsImportClause {
                default: Some("d".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            import_replacement(&imp, "__tsb.a()", "__tsb"),
            "const d = __tsb.__d(__tsb.a());"
        );
    }

    #[test]
    fn replacement_for_named_imports() {
        let imp = es_import(
            (0, 10),
            "./b",
            EsImportClause {
                named: vec![
                    NamedBinding {
                        imported: "x".to_string(),
                        local: "x".to_string(),
                    },
                    NamedBinding {
                        imported: "y".to_string(),
                        local: "z".to_string(),
                    },
                ],
                ..Default::default()
            },
        );
        assert_eq!(
            import_replacement(&imp, "__tsb.b()", "__tsb"),
            "const {x, y: z} = __tsb.b();"
        );
    }

    #[test]
    fn replacement_for_namespace_and_bare() {
        let ns = es_import(
            (0, 10),
            "./c",
            EsImportClause {
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            import_replacement(&ns, "__tsb.c()", "__tsb"),
            "const ns = __tsb.c();"
        );
        let bare = es_import((0, 10), "./d", EsImportClause::default());
        assert_eq!(import_replacement(&bare, "__tsb.d()", "__tsb"), "__tsb.d();");
    }

    #[test]
    fn replacement_for_reexports() {
        let star = SyntacticImport {
            span: (0, 10),
            specifier: "./e".to_string(),
            specifier_span: (0, 10),
            syntax: ImportSyntax::ExportFrom,
            clause: None,
            equals_name: None,
            reexport: Some(ReexportShape::Star),
            type_only: false,
        };
        assert_eq!(
            import_replacement(&star, "__tsb.e()", "__tsb"),
            "Object.assign(exports, __tsb.e());"
        );
    }

    #[test]
    fn wrapper_counts_lines() {
        let (content, offset, count) =
            wrap_module("src/a.ts", "a", "__tsb", "const x = 1;\nexports.x = x;", false);
        assert_eq!(offset, 4);
        assert_eq!(count, 8);
        assert_eq!(content.lines().count() as u32, count);
        assert!(content.starts_with("// src/a.ts\n"));
        assert!(content.contains("if (__tsb.a.exports != null) return __tsb.a.exports;"));
        assert!(content.ends_with("return exports;\n},"));
    }

    #[test]
    fn wrapper_for_empty_body() {
        let (content, offset, count) = wrap_module("src/e.ts", "e", "__tsb", "", false);
        assert_eq!(count, offset + 2);
        assert_eq!(content.lines().count() as u32, count);
    }

    #[test]
    fn wrapper_with_module_reference() {
        let (content, offset, _) =
            wrap_module("d.json", "d", "__tsb", "module.exports = {\"v\":42};", true);
        assert_eq!(offset, 5);
        assert!(content.contains("const module = {exports};"));
        assert!(content.contains("return __tsb.d.exports = module.exports;"));
    }

    #[test]
    fn boilerplate_strip() {
        let emitted = "\"use strict\";\nObject.defineProperty(exports, \"__esModule\", { value: true });\nexports.z = exports.y = void 0;\nconst x = 1;\n//# sourceMappingURL=a.js.map\n";
        assert_eq!(strip_boilerplate(emitted), "const x = 1;");
    }

    #[test]
    fn splices_apply_in_order() {
        let out = apply_splices(
            "aaa bbb ccc",
            vec![
                Splice {
                    start: 8,
                    end: 11,
                    text: "C".to_string(),
                },
                Splice {
                    start: 0,
                    end: 3,
                    text: "A".to_string(),
                },
            ],
        );
        assert_eq!(out, "A bbb C");
    }

    #[test]
    fn block_extraction_balances_braces() {
        let text = "before declare module \"m\" { a: { b: 1 } } after";
        let (start, end) = extract_block(text, "declare module").unwrap();
        assert_eq!(&text[start..end], "declare module \"m\" { a: { b: 1 } }");
    }

    #[test]
    fn line_map_is_parseable() {
        let map = build_line_map("/src/a.ts", 3, 2).unwrap();
        let parsed = sourcemap::SourceMap::from_slice(map.as_bytes()).unwrap();
        assert_eq!(parsed.get_token_count(), 3);
        let last = parsed.get_token(2).unwrap();
        assert_eq!(last.get_dst_line(), 2);
        // Clamped to the last source line.
        assert_eq!(last.get_src_line(), 1);
    }
}
