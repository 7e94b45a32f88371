use crate::core::interfaces::{
    Compiler, EsImportClause, ExportShape, ImportSyntax, NamedBinding, ReexportShape,
    ScanDiagnostic, ScanOutput, SyntacticExport, SyntacticImport,
};
use crate::core::models::ScriptKind;
use crate::utils::{Result, TsbError};
use once_cell::sync::Lazy;
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    BindingPatternKind, Declaration, ImportDeclarationSpecifier, Statement, TSModuleReference,
};
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::{GetSpan, SourceType};
use oxc_transformer::{TransformOptions, Transformer, TypeScriptOptions};
use regex::Regex;
use std::path::Path;

// Call forms the statement walk cannot see. Matches inside strings or
// comments are tolerated, as in any text-level pass.
static REQUIRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\brequire\s*\(\s*(['"])([^'"\n]+)['"]\s*\)"#).unwrap());
static DYNAMIC_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bimport\s*\(\s*(['"])([^'"\n]+)['"]\s*\)"#).unwrap());
static DYNAMIC_IMPORT_ANY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bimport\s*\(\s*[^'")\s]"#).unwrap());

/// The shipped `Compiler`: oxc parse for syntax and diagnostics, oxc
/// semantic + transformer + codegen for TS/JSX lowering.
pub struct OxcCompiler;

impl OxcCompiler {
    pub fn new() -> Self {
        Self
    }

    fn source_type(kind: ScriptKind) -> SourceType {
        match kind {
            ScriptKind::Ts | ScriptKind::Dts => SourceType::default()
                .with_typescript(true)
                .with_module(true),
            ScriptKind::Tsx => SourceType::default()
                .with_typescript(true)
                .with_jsx(true)
                .with_module(true),
            ScriptKind::Jsx => SourceType::default().with_jsx(true).with_module(true),
            _ => SourceType::default().with_module(true),
        }
    }
}

impl Default for OxcCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for OxcCompiler {
    fn script_kind(&self, path: &Path) -> ScriptKind {
        ScriptKind::from_path(path)
    }

    fn scan(&self, source: &str, kind: ScriptKind) -> Result<ScanOutput> {
        let allocator = Allocator::default();
        let parser = Parser::new(&allocator, source, Self::source_type(kind));
        let parsed = parser.parse();

        let mut out = ScanOutput::default();
        for error in &parsed.errors {
            out.diagnostics.push(ScanDiagnostic {
                message: error.to_string(),
                offset: None,
            });
        }

        for stmt in &parsed.program.body {
            match stmt {
                Statement::ImportDeclaration(decl) => {
                    let mut clause = EsImportClause::default();
                    if let Some(specifiers) = &decl.specifiers {
                        for spec in specifiers {
                            match spec {
                                ImportDeclarationSpecifier::ImportDefaultSpecifier(s) => {
                                    clause.default = Some(s.local.name.to_string());
                                }
                                ImportDeclarationSpecifier::ImportNamespaceSpecifier(s) => {
                                    clause.namespace = Some(s.local.name.to_string());
                                }
                                ImportDeclarationSpecifier::ImportSpecifier(s) => {
                                    clause.named.push(NamedBinding {
                                        imported: s.imported.name().to_string(),
                                        local: s.local.name.to_string(),
                                    });
                                }
                            }
                        }
                    }
                    out.imports.push(SyntacticImport {
                        span: span_of(decl.span),
                        specifier: decl.source.value.to_string(),
                        specifier_span: span_of(decl.source.span),
                        syntax: ImportSyntax::EsImport,
                        clause: Some(clause),
                        equals_name: None,
                        reexport: None,
                        type_only: decl.import_kind.is_type(),
                    });
                }
                Statement::ExportNamedDeclaration(decl) => {
                    if let Some(source) = &decl.source {
                        let names = decl
                            .specifiers
                            .iter()
                            .map(|s| NamedBinding {
                                imported: s.local.name().to_string(),
                                local: s.exported.name().to_string(),
                            })
                            .collect();
                        out.imports.push(SyntacticImport {
                            span: span_of(decl.span),
                            specifier: source.value.to_string(),
                            specifier_span: span_of(source.span),
                            syntax: ImportSyntax::ExportFrom,
                            clause: None,
                            equals_name: None,
                            reexport: Some(ReexportShape::Named(names)),
                            type_only: decl.export_kind.is_type(),
                        });
                    } else if let Some(declaration) = &decl.declaration {
                        let names = declared_value_names(declaration);
                        if !names.is_empty() {
                            out.exports.push(SyntacticExport {
                                span: (decl.span.start as usize, declaration.span().start as usize),
                                shape: ExportShape::Declaration { names },
                            });
                        } else if !is_type_only_declaration(declaration) {
                            // A value declaration we could not name; leave the
                            // modifier for the emitter to reject loudly.
                            out.diagnostics.push(ScanDiagnostic {
                                message: "unsupported export declaration form".to_string(),
                                offset: Some(decl.span.start as usize),
                            });
                        } else {
                            // Type-only: strip the whole statement later via
                            // the TS transform; nothing to record.
                        }
                    } else if !decl.export_kind.is_type() {
                        let names = decl
                            .specifiers
                            .iter()
                            .map(|s| NamedBinding {
                                imported: s.local.name().to_string(),
                                local: s.exported.name().to_string(),
                            })
                            .collect();
                        out.exports.push(SyntacticExport {
                            span: span_of(decl.span),
                            shape: ExportShape::List { names },
                        });
                    }
                }
                Statement::ExportAllDeclaration(decl) => {
                    out.imports.push(SyntacticImport {
                        span: span_of(decl.span),
                        specifier: decl.source.value.to_string(),
                        specifier_span: span_of(decl.source.span),
                        syntax: ImportSyntax::ExportFrom,
                        clause: None,
                        equals_name: None,
                        reexport: Some(ReexportShape::Star),
                        type_only: decl.export_kind.is_type(),
                    });
                }
                Statement::ExportDefaultDeclaration(decl) => {
                    out.exports.push(SyntacticExport {
                        span: (decl.span.start as usize, decl.declaration.span().start as usize),
                        shape: ExportShape::Default,
                    });
                }
                Statement::TSImportEqualsDeclaration(decl) => {
                    if let TSModuleReference::ExternalModuleReference(reference) =
                        &decl.module_reference
                    {
                        out.imports.push(SyntacticImport {
                            span: span_of(decl.span),
                            specifier: reference.expression.value.to_string(),
                            specifier_span: span_of(reference.expression.span),
                            syntax: ImportSyntax::ImportEquals,
                            clause: None,
                            equals_name: Some(decl.id.name.to_string()),
                            reexport: None,
                            type_only: decl.import_kind.is_type(),
                        });
                    }
                }
                _ => {}
            }
        }

        scan_call_forms(source, &mut out);
        out.imports.sort_by_key(|i| i.span.0);
        Ok(out)
    }

    fn emit(&self, source: &str, kind: ScriptKind) -> Result<String> {
        if !matches!(kind, ScriptKind::Ts | ScriptKind::Tsx | ScriptKind::Jsx) {
            return Ok(source.to_string());
        }

        let allocator = Allocator::default();
        let parser = Parser::new(&allocator, source, Self::source_type(kind));
        let parsed = parser.parse();
        if !parsed.errors.is_empty() {
            return Err(TsbError::JsError {
                message: parsed.errors[0].to_string(),
                importer: String::new(),
            });
        }

        let mut program = parsed.program;
        let semantic = SemanticBuilder::new().build(&program).semantic;
        let transform_options = TransformOptions {
            typescript: TypeScriptOptions::default(),
            ..Default::default()
        };
        let transformer = Transformer::new(&allocator, Path::new(""), &transform_options);
        let _ = transformer.build_with_scoping(semantic.into_scoping(), &mut program);

        Ok(Codegen::new().build(&program).code)
    }
}

fn span_of(span: oxc_span::Span) -> (usize, usize) {
    (span.start as usize, span.end as usize)
}

/// Runtime names bound by an exported declaration, or empty when there are
/// none (type-only or unsupported forms).
fn declared_value_names(declaration: &Declaration) -> Vec<String> {
    let mut names = Vec::new();
    match declaration {
        Declaration::VariableDeclaration(var) => {
            for declarator in &var.declarations {
                collect_binding_names(&declarator.id.kind, &mut names);
            }
        }
        Declaration::FunctionDeclaration(func) => {
            if let Some(id) = &func.id {
                names.push(id.name.to_string());
            }
        }
        Declaration::ClassDeclaration(class) => {
            if let Some(id) = &class.id {
                names.push(id.name.to_string());
            }
        }
        Declaration::TSEnumDeclaration(ts_enum) => {
            names.push(ts_enum.id.name.to_string());
        }
        _ => {}
    }
    names
}

fn is_type_only_declaration(declaration: &Declaration) -> bool {
    matches!(
        declaration,
        Declaration::TSTypeAliasDeclaration(_)
            | Declaration::TSInterfaceDeclaration(_)
            | Declaration::TSModuleDeclaration(_)
    )
}

fn collect_binding_names(kind: &BindingPatternKind, names: &mut Vec<String>) {
    match kind {
        BindingPatternKind::BindingIdentifier(ident) => names.push(ident.name.to_string()),
        BindingPatternKind::ObjectPattern(object) => {
            for property in &object.properties {
                collect_binding_names(&property.value.kind, names);
            }
            if let Some(rest) = &object.rest {
                collect_binding_names(&rest.argument.kind, names);
            }
        }
        BindingPatternKind::ArrayPattern(array) => {
            for element in array.elements.iter().flatten() {
                collect_binding_names(&element.kind, names);
            }
            if let Some(rest) = &array.rest {
                collect_binding_names(&rest.argument.kind, names);
            }
        }
        BindingPatternKind::AssignmentPattern(assignment) => {
            collect_binding_names(&assignment.left.kind, names);
        }
    }
}

/// `require('m')` and `import('m')` expressions, plus non-literal dynamic
/// imports. Matches overlapping an already-recorded statement span (an
/// `import x = require('m')`) are skipped.
fn scan_call_forms(source: &str, out: &mut ScanOutput) {
    let covered: Vec<(usize, usize)> = out.imports.iter().map(|i| i.span).collect();
    let is_covered = |at: usize| covered.iter().any(|(start, end)| at >= *start && at < *end);

    for capture in REQUIRE_RE.captures_iter(source) {
        let whole = capture.get(0).unwrap();
        if is_covered(whole.start()) {
            continue;
        }
        let literal = capture.get(2).unwrap();
        out.imports.push(SyntacticImport {
            span: (whole.start(), whole.end()),
            specifier: literal.as_str().to_string(),
            specifier_span: (literal.start(), literal.end()),
            syntax: ImportSyntax::Require,
            clause: None,
            equals_name: None,
            reexport: None,
            type_only: false,
        });
    }

    for capture in DYNAMIC_IMPORT_RE.captures_iter(source) {
        let whole = capture.get(0).unwrap();
        if is_covered(whole.start()) {
            continue;
        }
        let literal = capture.get(2).unwrap();
        out.imports.push(SyntacticImport {
            span: (whole.start(), whole.end()),
            specifier: literal.as_str().to_string(),
            specifier_span: (literal.start(), literal.end()),
            syntax: ImportSyntax::DynamicImport,
            clause: None,
            equals_name: None,
            reexport: None,
            type_only: false,
        });
    }

    for found in DYNAMIC_IMPORT_ANY_RE.find_iter(source) {
        if !is_covered(found.start()) {
            out.non_literal_dynamic_imports.push(found.start());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str, kind: ScriptKind) -> ScanOutput {
        OxcCompiler::new().scan(source, kind).unwrap()
    }

    #[test]
    fn scans_es_import_forms() {
        let src = "import d from './a';\nimport * as ns from './b';\nimport {x, y as z} from './c';\nimport './d';\n";
        let out = scan(src, ScriptKind::Ts);
        assert_eq!(out.imports.len(), 4);

        let d = &out.imports[0];
        assert_eq!(d.specifier, "./a");
        assert_eq!(d.clause.as_ref().unwrap().default.as_deref(), Some("d"));

        let ns = &out.imports[1];
        assert_eq!(ns.clause.as_ref().unwrap().namespace.as_deref(), Some("ns"));

        let named = &out.imports[2];
        let bindings = &named.clause.as_ref().unwrap().named;
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].imported, "y");
        assert_eq!(bindings[1].local, "z");

        let bare = &out.imports[3];
        assert!(bare.clause.as_ref().unwrap().default.is_none());
        assert!(bare.clause.as_ref().unwrap().named.is_empty());
    }

    #[test]
    fn scans_exports() {
        let src = "export const x = 1;\nexport function f() {}\nexport default 42;\nexport {x as y};\n";
        let out = scan(src, ScriptKind::Ts);
        assert_eq!(out.exports.len(), 4);
        assert!(matches!(
            &out.exports[0].shape,
            ExportShape::Declaration { names } if names == &vec!["x".to_string()]
        ));
        assert!(matches!(
            &out.exports[1].shape,
            ExportShape::Declaration { names } if names == &vec!["f".to_string()]
        ));
        assert!(matches!(out.exports[2].shape, ExportShape::Default));
        assert!(matches!(
            &out.exports[3].shape,
            ExportShape::List { names } if names[0].local == "y"
        ));
    }

    #[test]
    fn scans_reexports_as_imports() {
        let src = "export {a} from './a';\nexport * from './b';\n";
        let out = scan(src, ScriptKind::Ts);
        assert_eq!(out.imports.len(), 2);
        assert!(matches!(
            out.imports[0].reexport,
            Some(ReexportShape::Named(_))
        ));
        assert!(matches!(out.imports[1].reexport, Some(ReexportShape::Star)));
        assert!(out.exports.is_empty());
    }

    #[test]
    fn scans_require_and_dynamic_import() {
        let src = "const a = require('./a');\nconst b = import('./b');\n";
        let out = scan(src, ScriptKind::Js);
        assert_eq!(out.imports.len(), 2);
        assert_eq!(out.imports[0].syntax, ImportSyntax::Require);
        assert_eq!(out.imports[1].syntax, ImportSyntax::DynamicImport);
        assert!(out.non_literal_dynamic_imports.is_empty());
    }

    #[test]
    fn import_equals_is_not_double_counted() {
        let src = "import x = require('./x');\n";
        let out = scan(src, ScriptKind::Ts);
        assert_eq!(out.imports.len(), 1);
        assert_eq!(out.imports[0].syntax, ImportSyntax::ImportEquals);
        assert_eq!(out.imports[0].equals_name.as_deref(), Some("x"));
    }

    #[test]
    fn flags_non_literal_dynamic_import() {
        let src = "const m = import(name);\n";
        let out = scan(src, ScriptKind::Js);
        assert_eq!(out.non_literal_dynamic_imports.len(), 1);
    }

    #[test]
    fn type_only_imports_are_marked() {
        let src = "import type {T} from './types';\n";
        let out = scan(src, ScriptKind::Ts);
        assert!(out.imports[0].type_only);
    }

    #[test]
    fn emit_strips_typescript() {
        let out = OxcCompiler::new()
            .emit("const x: number = 1;\ninterface Q { a: string }\n", ScriptKind::Ts)
            .unwrap();
        assert!(out.contains("const x = 1"));
        assert!(!out.contains("interface"));
        assert!(!out.contains(": number"));
    }

    #[test]
    fn emit_passes_js_through() {
        let src = "const x = 1; // keep me\n";
        let out = OxcCompiler::new().emit(src, ScriptKind::Js).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn parse_errors_surface_as_diagnostics() {
        let out = scan("const = ;", ScriptKind::Ts);
        assert!(!out.diagnostics.is_empty());
    }
}
