use crate::core::models::ScriptKind;
use crate::utils::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Local name bound to an imported (or re-exported) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedBinding {
    pub imported: String,
    pub local: String,
}

/// Bindings introduced by an ES `import` clause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsImportClause {
    pub default: Option<String>,
    pub namespace: Option<String>,
    pub named: Vec<NamedBinding>,
}

/// Names flowing back out of an `export ... from` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReexportShape {
    Star,
    Named(Vec<NamedBinding>),
}

/// Which syntactic form referenced the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSyntax {
    EsImport,
    ExportFrom,
    ImportEquals,
    Require,
    DynamicImport,
}

/// One module reference found in a source file, with enough span
/// information to splice a replacement over it.
#[derive(Debug, Clone)]
pub struct SyntacticImport {
    /// Byte range of the full statement (or call expression).
    pub span: (usize, usize),
    pub specifier: String,
    /// Byte offset and length of the specifier literal, for diagnostics.
    pub specifier_span: (usize, usize),
    pub syntax: ImportSyntax,
    pub clause: Option<EsImportClause>,
    /// Local name of `import x = require(...)`.
    pub equals_name: Option<String>,
    pub reexport: Option<ReexportShape>,
    /// `import type` / `export type`; dropped without a child record.
    pub type_only: bool,
}

/// Shape of a non-`from` export statement.
#[derive(Debug, Clone)]
pub enum ExportShape {
    /// `export const x = ...` etc. The span covers only the `export`
    /// modifier to strip; `names` are appended as `exports.<n> = <n>;`.
    Declaration { names: Vec<String> },
    /// `export default <expr>`; the span covers both keywords.
    Default,
    /// `export { a, b as c };` where the whole statement is replaced.
    List { names: Vec<NamedBinding> },
}

#[derive(Debug, Clone)]
pub struct SyntacticExport {
    pub span: (usize, usize),
    pub shape: ExportShape,
}

/// A compiler diagnostic surfaced by scanning.
#[derive(Debug, Clone)]
pub struct ScanDiagnostic {
    pub message: String,
    pub offset: Option<usize>,
}

/// Everything the refiner needs to know about one source file's syntax.
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub imports: Vec<SyntacticImport>,
    pub exports: Vec<SyntacticExport>,
    pub diagnostics: Vec<ScanDiagnostic>,
    /// Byte offsets of `import(expr)` calls with a non-literal argument.
    pub non_literal_dynamic_imports: Vec<usize>,
}

impl ScanOutput {
    pub fn has_es_exports(&self) -> bool {
        !self.exports.is_empty() || self.imports.iter().any(|i| i.reexport.is_some())
    }
}

/// The external compiler contract. The engine treats parse, syntax scanning
/// and JS emit as a library service and never reaches for compiler types
/// directly; `OxcCompiler` is the shipped implementation.
pub trait Compiler: Send + Sync {
    fn script_kind(&self, path: &Path) -> ScriptKind;

    /// Parse and report syntactic module references, export statements and
    /// diagnostics. Does not transform.
    fn scan(&self, source: &str, kind: ScriptKind) -> Result<ScanOutput>;

    /// Lower TS/TSX/JSX to plain JavaScript. `Js` input passes through.
    fn emit(&self, source: &str, kind: ScriptKind) -> Result<String>;
}

/// Filesystem seam. The default implementation hits the real disk; overlays
/// wrap an inner system and override chosen paths.
#[async_trait]
pub trait VirtualSystem: Send + Sync {
    async fn is_file(&self, path: &Path) -> bool;
    async fn is_dir(&self, path: &Path) -> bool;
    async fn read(&self, path: &Path) -> Result<String>;
    /// Modification time in milliseconds since the epoch.
    async fn mtime(&self, path: &Path) -> Option<u64>;
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>>;
    /// Lexical normalization; never touches the disk.
    fn resolve_path(&self, path: &Path) -> PathBuf;
}
