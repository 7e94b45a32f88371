use crate::config::{BundleTarget, SourceMapMode};
use crate::context::MainContext;
use crate::core::models::{ExportRule, ExternalMode, ModuleId, RefinedModule, ScriptKind};
use crate::infrastructure::file_system::relative_path;
use crate::utils::{js_string, require_call, Logger, Result, TsbError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sourcemap::SourceMapBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// What the graph driver hands the single-consumer writer, in commit order.
#[derive(Debug)]
pub enum WriterMessage {
    Module {
        id: Arc<ModuleId>,
        refined: Arc<RefinedModule>,
    },
    /// Refinement failed; a throwing placeholder keeps the bundle parseable.
    Stub { id: Arc<ModuleId>, mpath: String },
}

/// Everything the bundler needs back from the writer task.
#[derive(Debug, Default)]
pub struct AssembledOutput {
    pub modules_written: usize,
    /// Lines contributed by the module section; always the sum of the
    /// written modules' `output_line_count`s.
    pub module_section_lines: u32,
    pub source_map_path: Option<PathBuf>,
    pub declaration_path: Option<PathBuf>,
}

/// Streams prologue, module payloads in arrival order, epilogue and footer;
/// merges per-module source maps at their line offsets; writes the parallel
/// declaration file.
pub struct OutputAssembler {
    target: Arc<BundleTarget>,
    ctx: Arc<MainContext>,
    entry_id: Arc<ModuleId>,
    output_key: String,
    file: Option<tokio::fs::File>,
    /// Newlines written so far; the next line's 0-based index.
    lines_written: u32,
    map: SourceMapBuilder,
    has_map_tokens: bool,
    preimports: Vec<(Arc<ModuleId>, String)>,
    declarations: Vec<(Arc<ModuleId>, String)>,
    global_declarations: Vec<String>,
    uses_resolve: bool,
    uses_default_helper: bool,
    modules_written: usize,
    module_section_lines: u32,
}

impl OutputAssembler {
    pub fn new(target: Arc<BundleTarget>, ctx: Arc<MainContext>, entry_id: Arc<ModuleId>) -> Self {
        let output_key = target.output.display().to_string().replace('\\', "/");
        Self {
            target,
            ctx,
            entry_id,
            output_key,
            file: None,
            lines_written: 0,
            map: SourceMapBuilder::new(None),
            has_map_tokens: false,
            preimports: Vec::new(),
            declarations: Vec::new(),
            global_declarations: Vec::new(),
            uses_resolve: false,
            uses_default_helper: false,
            modules_written: 0,
            module_section_lines: 0,
        }
    }

    fn global_var(&self) -> &str {
        &self.target.options.global_module_var_name
    }

    /// Consumes the writer queue until the driver closes it, then finishes
    /// the artifacts.
    pub async fn run(mut self, mut rx: mpsc::Receiver<WriterMessage>) -> Result<AssembledOutput> {
        while let Some(message) = rx.recv().await {
            match message {
                WriterMessage::Module { id, refined } => {
                    self.write_module(&id, &refined).await?;
                    self.ctx.memory_cache().lock().release(id.integer_id);
                }
                WriterMessage::Stub { id, mpath } => self.write_stub(&id, &mpath).await?,
            }
        }
        self.finish().await
    }

    async fn ensure_prologue(&mut self, first_line_comment: Option<&str>) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.target.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.file = Some(tokio::fs::File::create(&self.target.output).await?);

        let gv = self.global_var().to_string();
        let mut prologue = String::new();
        if let Some(comment) = first_line_comment {
            prologue.push_str(comment);
            prologue.push('\n');
        }
        if let Some(wrap_begin) = &self.target.options.wrap_begin {
            prologue.push_str(wrap_begin);
            prologue.push('\n');
        }
        prologue.push_str("\"use strict\";\n");
        match &self.target.export_rule {
            ExportRule::None | ExportRule::CommonJs => {
                prologue.push_str(&format!("const {} = {{\n", gv));
            }
            ExportRule::Es2015 => {
                prologue.push_str(&format!("export const {} = {{\n", gv));
            }
            ExportRule::Var { decl, name } => {
                prologue.push_str(&format!("{} {} = (() => {{\n", decl, name));
                prologue.push_str(&format!("const {} = {{\n", gv));
            }
            ExportRule::Direct { target } => {
                prologue.push_str("(() => {\n");
                prologue.push_str(&format!("const {} = {}.{} = {{\n", gv, target, gv));
            }
        }
        self.write_text(&prologue).await
    }

    async fn write_text(&mut self, text: &str) -> Result<()> {
        self.lines_written += text.bytes().filter(|b| *b == b'\n').count() as u32;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TsbError::internal("writer used before prologue"))?;
        file.write_all(text.as_bytes()).await.map_err(TsbError::Io)
    }

    async fn write_module(&mut self, id: &Arc<ModuleId>, refined: &RefinedModule) -> Result<()> {
        self.ensure_prologue(refined.first_line_comment.as_deref())
            .await?;

        // Collect preimports and declarations as they stream by.
        for import in &refined.imports {
            if import.external_mode == ExternalMode::Preimport {
                let pre = self
                    .ctx
                    .module_id(&self.output_key, &import.mpath, ScriptKind::Unknown);
                if !self.preimports.iter().any(|(p, _)| p.integer_id == pre.integer_id) {
                    self.preimports.push((pre, import.mpath.clone()));
                }
            }
        }
        if let Some(declaration) = &refined.declaration {
            self.declarations.push((id.clone(), declaration.clone()));
        }
        if let Some(global) = &refined.global_declaration {
            self.global_declarations.push(global.clone());
        }
        let gv = self.global_var().to_string();
        if refined.content.contains(&format!("{}.__resolve(", gv)) {
            self.uses_resolve = true;
        }
        if refined.content.contains(&format!("{}.__d(", gv)) {
            self.uses_default_helper = true;
        }

        let start_line = self.lines_written + refined.source_map_output_line_offset;
        self.append_source_map(refined, start_line);

        self.write_text(&refined.content).await?;
        self.write_text("\n").await?;
        self.modules_written += 1;
        self.module_section_lines += refined.output_line_count;
        Ok(())
    }

    async fn write_stub(&mut self, id: &Arc<ModuleId>, mpath: &str) -> Result<()> {
        self.ensure_prologue(None).await?;
        let stub = format!(
            "{}(){{ throw Error({}); }},\n",
            id.var_name,
            js_string(&format!("Cannot find module '{}'", mpath))
        );
        self.write_text(&stub).await?;
        self.modules_written += 1;
        self.module_section_lines += 1;
        Ok(())
    }

    /// Re-bases one module's map tokens at its output position; sources are
    /// rewritten relative to the output directory. A failure skips the
    /// module's mappings only.
    fn append_source_map(&mut self, refined: &RefinedModule, start_line: u32) {
        if self.target.source_map == SourceMapMode::None {
            return;
        }
        let Some(text) = &refined.source_map_text else {
            return;
        };
        let parsed = match sourcemap::SourceMap::from_slice(text.as_bytes()) {
            Ok(parsed) => parsed,
            Err(err) => {
                Logger::warn(&format!("skipping a module's source map: {}", err));
                return;
            }
        };
        let out_dir = self
            .target
            .output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for token in parsed.tokens() {
            let source_id = token.get_source().map(|source| {
                let rel = relative_path(&out_dir, Path::new(source));
                self.map
                    .add_source(&rel.display().to_string().replace('\\', "/"))
            });
            self.map.add_raw(
                token.get_dst_line() + start_line,
                token.get_dst_col(),
                token.get_src_line(),
                token.get_src_col(),
                source_id,
                None,
                false,
            );
            self.has_map_tokens = true;
        }
    }

    async fn finish(mut self) -> Result<AssembledOutput> {
        self.ensure_prologue(None).await?;
        let gv = self.global_var().to_string();
        let entry_var = self.entry_id.var_name.clone();
        let export_lib = self.target.options.export_lib;

        let mut epilogue = String::new();
        if self.uses_default_helper {
            epilogue
                .push_str("__d(m){ return m && m.__esModule ? m.default : m; },\n");
        }
        for (pre, mpath) in &self.preimports {
            epilogue.push_str(&format!("{}: {},\n", pre.var_name, require_call(mpath)));
        }
        if self.uses_resolve {
            if self.target.options.browser {
                epilogue.push_str("__dirname: new URL(\".\", location.href).href,\n");
                epilogue.push_str(&format!(
                    "__resolve(rpath){{ return new URL(rpath, {}.__dirname).href; }},\n",
                    gv
                ));
            } else {
                epilogue.push_str("__dirname: __dirname,\n");
                epilogue.push_str(&format!(
                    "__resolve(rpath){{ return require(\"path\").join({}.__dirname, rpath); }},\n",
                    gv
                ));
            }
        }
        epilogue.push_str("};\n");

        match &self.target.export_rule {
            ExportRule::None | ExportRule::CommonJs => {
                if export_lib {
                    epilogue.push_str(&format!("module.exports = {};\n", gv));
                } else {
                    epilogue.push_str(&format!("module.exports={}.{}();\n", gv, entry_var));
                }
            }
            ExportRule::Es2015 => {
                if !export_lib {
                    epilogue.push_str(&format!("export default {}.{}();\n", gv, entry_var));
                }
            }
            ExportRule::Var { .. } => {
                if export_lib {
                    epilogue.push_str(&format!("return {};\n", gv));
                } else {
                    epilogue.push_str(&format!("return {}.{}();\n", gv, entry_var));
                }
                epilogue.push_str("})();\n");
            }
            ExportRule::Direct { .. } => {
                if !export_lib {
                    epilogue.push_str(&format!("{}.{}();\n", gv, entry_var));
                }
                epilogue.push_str("})();\n");
            }
        }
        self.write_text(&epilogue).await?;

        // Source map after the footer so the reference can be the last line.
        let mut out = AssembledOutput {
            modules_written: self.modules_written,
            module_section_lines: self.module_section_lines,
            ..Default::default()
        };
        if self.target.source_map != SourceMapMode::None && self.has_map_tokens {
            let map = std::mem::replace(&mut self.map, SourceMapBuilder::new(None)).into_sourcemap();
            let mut buffer = Vec::new();
            if let Err(err) = map.to_writer(&mut buffer) {
                Logger::warn(&format!("could not serialize the bundle source map: {}", err));
            } else {
                match self.target.source_map {
                    SourceMapMode::Inline => {
                        let url = format!(
                            "//# sourceMappingURL=data:application/json;base64,{}\n",
                            BASE64.encode(&buffer)
                        );
                        self.write_text(&url).await?;
                    }
                    SourceMapMode::File => {
                        let map_path = PathBuf::from(format!(
                            "{}.map",
                            self.target.output.display()
                        ));
                        let name = map_path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or("bundle.js.map")
                            .to_string();
                        tokio::fs::write(&map_path, &buffer).await?;
                        self.write_text(&format!("//# sourceMappingURL={}\n", name))
                            .await?;
                        out.source_map_path = Some(map_path);
                    }
                    SourceMapMode::None => {}
                }
            }
        }
        if let Some(wrap_end) = self.target.options.wrap_end.clone() {
            self.write_text(&wrap_end).await?;
            self.write_text("\n").await?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush().await.map_err(TsbError::Io)?;
        }

        if self.target.declaration {
            out.declaration_path = Some(self.write_declaration_file().await?);
        }
        Ok(out)
    }

    async fn write_declaration_file(&self) -> Result<PathBuf> {
        let gv = self.global_var();
        let path = self.target.output.with_extension("d.ts");
        let mut text = String::new();
        if let Some(begin) = &self.target.options.decl_wrap_begin {
            text.push_str(begin);
            text.push('\n');
        }
        text.push_str(&format!("declare namespace {} {{\n", gv));
        for (id, declaration) in &self.declarations {
            text.push_str(&format!("export namespace {} {{\n", id.var_name));
            text.push_str(declaration);
            text.push_str("\n}\n");
        }
        text.push_str("}\n");
        for global in &self.global_declarations {
            text.push_str(global);
            text.push('\n');
        }
        text.push_str(&format!("export = {}.{};\n", gv, self.entry_id.var_name));
        if let Some(end) = &self.target.options.decl_wrap_end {
            text.push_str(end);
            text.push('\n');
        }
        tokio::fs::write(&path, text).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve_targets, TsbConfig};
    use crate::core::models::ImportInfo;

    fn target_for(dir: &Path, compiler_options: &str) -> Arc<BundleTarget> {
        let config: TsbConfig = serde_json::from_str(&format!(
            r#"{{"entry":"a.ts","compilerOptions":{}}}"#,
            compiler_options
        ))
        .unwrap();
        let targets = resolve_targets(dir, &config, None, &[], None).unwrap();
        Arc::new(targets.into_iter().next().unwrap())
    }

    fn refined(content: &str, offset: u32) -> Arc<RefinedModule> {
        let mut module = RefinedModule {
            content: content.to_string(),
            source_map_output_line_offset: offset,
            output_line_count: content.lines().count() as u32,
            ..Default::default()
        };
        module.compute_size();
        Arc::new(module)
    }

    #[tokio::test]
    async fn assembles_prologue_modules_footer() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MainContext::with_defaults(dir.path().join("cache"));
        let target = target_for(dir.path(), "{}");
        let entry = ctx.module_id("out", &format!("{}/a.ts", dir.path().display()), ScriptKind::Ts);

        let (tx, rx) = mpsc::channel(10);
        let assembler = OutputAssembler::new(target.clone(), ctx.clone(), entry.clone());
        let task = tokio::spawn(assembler.run(rx));
        tx.send(WriterMessage::Module {
            id: entry.clone(),
            refined: refined("// a.ts\na(){\nreturn exports;\n},", 2),
        })
        .await
        .unwrap();
        drop(tx);
        let out = task.await.unwrap().unwrap();
        assert_eq!(out.modules_written, 1);
        // The module section is exactly the sum of written line counts.
        assert_eq!(out.module_section_lines, 4);

        let text = std::fs::read_to_string(&target.output).unwrap();
        assert!(text.starts_with("\"use strict\";\nconst __tsb = {\n"));
        assert!(text.contains("// a.ts\na(){"));
        assert!(text.trim_end().ends_with("module.exports=__tsb.a();"));
    }

    #[tokio::test]
    async fn stub_throws_at_call_time() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MainContext::with_defaults(dir.path().join("cache"));
        let target = target_for(dir.path(), "{}");
        let entry = ctx.module_id("out", "/missing/a.ts", ScriptKind::Ts);

        let (tx, rx) = mpsc::channel(10);
        let task = tokio::spawn(OutputAssembler::new(target.clone(), ctx, entry.clone()).run(rx));
        tx.send(WriterMessage::Stub {
            id: entry,
            mpath: "./gone".to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let text = std::fs::read_to_string(&target.output).unwrap();
        assert!(text.contains("a(){ throw Error(\"Cannot find module './gone'\"); },"));
    }

    #[tokio::test]
    async fn preimports_emit_host_requires() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MainContext::with_defaults(dir.path().join("cache"));
        let target = target_for(dir.path(), "{}");
        let entry = ctx.module_id("out", &format!("{}/a.ts", dir.path().display()), ScriptKind::Ts);

        let mut module = RefinedModule {
            content: "// a.ts\na(){\nconst fs = __tsb.fs;\nreturn exports;\n},".to_string(),
            source_map_output_line_offset: 2,
            output_line_count: 5,
            imports: vec![ImportInfo {
                apath: None,
                mpath: "fs".to_string(),
                declaration: false,
                external_mode: ExternalMode::Preimport,
                pos: None,
            }],
            ..Default::default()
        };
        module.compute_size();

        let (tx, rx) = mpsc::channel(10);
        let task = tokio::spawn(OutputAssembler::new(target.clone(), ctx, entry.clone()).run(rx));
        tx.send(WriterMessage::Module {
            id: entry,
            refined: Arc::new(module),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let text = std::fs::read_to_string(&target.output).unwrap();
        assert!(text.contains("fs: require('fs'),"));
    }

    #[tokio::test]
    async fn source_map_lines_are_rebased() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MainContext::with_defaults(dir.path().join("cache"));
        let target = target_for(dir.path(), r#"{"sourceMap":true}"#);
        let entry = ctx.module_id("out", &format!("{}/a.ts", dir.path().display()), ScriptKind::Ts);

        // A one-token map at body line 0 of the module.
        let mut builder = SourceMapBuilder::new(None);
        let sid = builder.add_source(&format!("{}/a.ts", dir.path().display()));
        builder.add_raw(0, 0, 0, 0, Some(sid), None, false);
        let mut buffer = Vec::new();
        builder.into_sourcemap().to_writer(&mut buffer).unwrap();

        let mut module = RefinedModule {
            content: "// a.ts\na(){\nconst x = 1;\nreturn exports;\n},".to_string(),
            source_map_output_line_offset: 2,
            output_line_count: 5,
            source_map_text: Some(String::from_utf8(buffer).unwrap()),
            ..Default::default()
        };
        module.compute_size();

        let (tx, rx) = mpsc::channel(10);
        let task = tokio::spawn(OutputAssembler::new(target.clone(), ctx, entry.clone()).run(rx));
        tx.send(WriterMessage::Module {
            id: entry,
            refined: Arc::new(module),
        })
        .await
        .unwrap();
        drop(tx);
        let out = task.await.unwrap().unwrap();

        let map_path = out.source_map_path.unwrap();
        let map = sourcemap::SourceMap::from_slice(&std::fs::read(&map_path).unwrap()).unwrap();
        let token = map.get_token(0).unwrap();
        // Prologue is 2 lines, module offset 2: body line 0 lands on line 4.
        assert_eq!(token.get_dst_line(), 4);
        assert_eq!(token.get_source(), Some("a.ts"));

        let bundle = std::fs::read_to_string(&target.output).unwrap();
        let last_line = bundle.trim_end().lines().last().unwrap();
        assert!(last_line.starts_with("//# sourceMappingURL="));
        // The referenced line index exists in the bundle.
        assert!((token.get_dst_line() as usize) < bundle.lines().count());
    }

    #[tokio::test]
    async fn declaration_file_wraps_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = MainContext::with_defaults(dir.path().join("cache"));
        let target = target_for(dir.path(), r#"{"declaration":true}"#);
        let entry = ctx.module_id("out", &format!("{}/a.ts", dir.path().display()), ScriptKind::Ts);

        let mut module = RefinedModule {
            content: "// a.ts\na(){\nreturn exports;\n},".to_string(),
            source_map_output_line_offset: 2,
            output_line_count: 4,
            declaration: Some("export const x: number;".to_string()),
            ..Default::default()
        };
        module.compute_size();

        let (tx, rx) = mpsc::channel(10);
        let task = tokio::spawn(OutputAssembler::new(target.clone(), ctx, entry.clone()).run(rx));
        tx.send(WriterMessage::Module {
            id: entry,
            refined: Arc::new(module),
        })
        .await
        .unwrap();
        drop(tx);
        let out = task.await.unwrap().unwrap();

        let decl = std::fs::read_to_string(out.declaration_path.unwrap()).unwrap();
        assert!(decl.contains("declare namespace __tsb {"));
        assert!(decl.contains("export namespace a {"));
        assert!(decl.contains("export const x: number;"));
        assert!(decl.trim_end().ends_with("export = __tsb.a;"));
    }
}
