use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tsbundle::{bundle_all, bundle_target, resolve_targets, BundleStats, MainContext, TsbConfig};

fn write(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn context(dir: &Path) -> Arc<MainContext> {
    MainContext::with_defaults(dir.join(".tsbundle-cache"))
}

async fn bundle(
    ctx: &Arc<MainContext>,
    dir: &Path,
    config_json: &str,
    entry: &str,
) -> (BundleStats, String) {
    let config: TsbConfig = serde_json::from_str(config_json).unwrap();
    let targets = resolve_targets(dir, &config, None, &[entry.to_string()], None).unwrap();
    let target = targets.into_iter().next().unwrap();
    let output = target.output.clone();
    let stats = bundle_target(ctx.clone(), target).await.unwrap();
    let text = std::fs::read_to_string(output).unwrap();
    (stats, text)
}

fn bump_mtime(path: &Path, seconds_ahead: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(seconds_ahead))
        .unwrap();
}

#[tokio::test]
async fn single_file_without_imports() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.ts", "export const x = 1;\n");

    let ctx = context(dir.path());
    let (stats, text) = bundle(&ctx, dir.path(), "{}", "a.ts").await;

    assert_eq!(stats.modules_written, 1);
    assert!(text.contains("x = 1"));
    assert!(text.trim_end().ends_with("module.exports=__tsb.a();"));
    // Balanced braces as a cheap parseability proxy.
    let opens = text.matches('{').count();
    let closes = text.matches('}').count();
    assert_eq!(opens, closes);
}

#[tokio::test]
async fn one_local_import() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.ts",
        "import {y} from './b';\nexport const z = y+1;\n",
    );
    write(dir.path(), "b.ts", "export const y = 2;\n");

    let ctx = context(dir.path());
    let (stats, text) = bundle(&ctx, dir.path(), "{}", "a.ts").await;

    assert_eq!(stats.modules_written, 2);
    // Exactly one wrapper per module.
    assert_eq!(text.matches("\na(){").count(), 1);
    assert_eq!(text.matches("\nb(){").count(), 1);
    // The import site calls into the registry.
    assert!(text.contains("__tsb.b()"));
    assert!(text.contains("exports.z = z;"));
    assert!(text.contains("exports.y = y;"));
}

#[tokio::test]
async fn external_import_is_preimported() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.ts",
        "import * as fs from 'fs';\nexport const p = fs.readFileSync;\n",
    );

    let ctx = context(dir.path());
    let (stats, text) = bundle(&ctx, dir.path(), "{}", "a.ts").await;

    assert_eq!(stats.modules_written, 1);
    assert!(text.contains("require('fs')"));
    // The registry has a property, not a wrapper, for fs.
    assert!(text.contains("fs: require('fs'),"));
    assert!(!text.contains("\nfs(){"));
    assert!(text.contains("const fs = __tsb.fs;"));
}

#[tokio::test]
async fn circular_import_with_check_enabled() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.ts",
        "import {b} from './b';\nexport const a = b;\n",
    );
    write(
        dir.path(),
        "b.ts",
        "import {a} from './a';\nexport const b = 1;\n",
    );

    let ctx = context(dir.path());
    let config = r#"{"bundlerOptions":{"checkCircularDependency":true}}"#;
    let (stats, _text) = bundle(&ctx, dir.path(), config, "a.ts").await;

    assert_eq!(stats.modules_written, 2);
    // The cycle is reported; the exit code goes non-zero.
    assert!(stats.error_count >= 1);
    assert!(ctx.error_count() >= 1);
}

#[tokio::test]
async fn json_import() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "data.json", "{\"v\":42}");
    write(
        dir.path(),
        "a.ts",
        "import d from './data.json';\nexport const v = d.v;\n",
    );

    let ctx = context(dir.path());
    let (stats, text) = bundle(&ctx, dir.path(), "{}", "a.ts").await;

    assert_eq!(stats.modules_written, 2);
    assert!(text.contains("module.exports = {\"v\":42};"));
    assert!(text.contains("__tsb.data()"));
    // Default import goes through the interop helper.
    assert!(text.contains("__tsb.__d("));
    assert!(text.contains("__d(m){"));
}

#[tokio::test]
async fn idempotent_second_run_serves_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.ts",
        "import {y} from './b';\nexport const z = y+1;\n",
    );
    write(dir.path(), "b.ts", "export const y = 2;\n");

    let first_ctx = context(dir.path());
    let (first_stats, first_text) = bundle(&first_ctx, dir.path(), "{}", "a.ts").await;
    assert_eq!(first_stats.refined_count, 2);

    // A fresh context re-reads the registry and disk cache.
    let second_ctx = context(dir.path());
    let (second_stats, second_text) = bundle(&second_ctx, dir.path(), "{}", "a.ts").await;
    assert_eq!(second_stats.refined_count, 0);
    assert_eq!(second_stats.cache_hit_count, 2);
    assert_eq!(first_text, second_text);
}

#[tokio::test]
async fn incremental_rebuild_refines_only_the_change() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.ts",
        "import {y} from './b';\nexport const z = y+1;\n",
    );
    write(dir.path(), "b.ts", "export const y = 2;\n");

    let ctx = context(dir.path());
    let (first, _) = bundle(&ctx, dir.path(), "{}", "a.ts").await;
    assert_eq!(first.refined_count, 2);

    write(dir.path(), "b.ts", "export const y = 3000;\n");
    bump_mtime(&dir.path().join("b.ts"), 5);

    let ctx2 = context(dir.path());
    let (second, text) = bundle(&ctx2, dir.path(), "{}", "a.ts").await;
    assert_eq!(second.refined_count, 1);
    assert_eq!(second.cache_hit_count, 1);
    assert!(text.contains("3000"));
}

#[tokio::test]
async fn absent_entry_reports_module_not_found_once() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path());
    let (stats, text) = bundle(&ctx, dir.path(), "{}", "missing.ts").await;

    assert_eq!(stats.error_count, 1);
    assert!(ctx.error_count() > 0);
    // The bundle still parses, throwing at call time.
    assert!(text.contains("throw Error(\"Cannot find module"));
}

#[tokio::test]
async fn empty_source_produces_empty_wrapper() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.ts", "");

    let ctx = context(dir.path());
    let (stats, text) = bundle(&ctx, dir.path(), "{}", "a.ts").await;

    assert_eq!(stats.modules_written, 1);
    assert_eq!(stats.error_count, 0);
    assert!(text.contains("a(){"));
    assert!(text.contains("return exports;"));
}

#[tokio::test]
async fn duplicate_output_paths_keep_one_bundle() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.ts", "export const x = 1;\n");
    write(dir.path(), "b.ts", "export const x = 2;\n");

    let ctx = context(dir.path());
    let config: TsbConfig = serde_json::from_str("{}").unwrap();
    let targets = resolve_targets(
        dir.path(),
        &config,
        None,
        &["a.ts".to_string(), "b.ts".to_string()],
        Some("same.bundle.js"),
    )
    .unwrap();
    let all = bundle_all(ctx.clone(), targets).await;

    assert_eq!(all.len(), 1);
    assert!(ctx.error_count() >= 1);
    let text = std::fs::read_to_string(dir.path().join("same.bundle.js")).unwrap();
    assert!(text.contains("x = 1"));
    assert!(!text.contains("x = 2"));
}

#[tokio::test]
async fn source_map_lines_stay_inside_the_bundle() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.ts",
        "import {y} from './b';\nexport const z = y+1;\n",
    );
    write(dir.path(), "b.ts", "export const y = 2;\nexport const q = 3;\n");

    let ctx = context(dir.path());
    let config = r#"{"compilerOptions":{"sourceMap":true}}"#;
    let (stats, text) = bundle(&ctx, dir.path(), config, "a.ts").await;

    let map_path = stats.source_map_path.expect("a sibling map is written");
    let map = sourcemap::SourceMap::from_slice(&std::fs::read(&map_path).unwrap()).unwrap();
    assert!(map.get_token_count() > 0);
    let bundle_lines = text.lines().count() as u32;
    let out_dir = dir.path();
    for token in map.tokens() {
        assert!(token.get_dst_line() < bundle_lines);
        let source = token.get_source().expect("token carries a source");
        assert!(out_dir.join(source).exists(), "missing source {}", source);
    }
    assert!(text.contains("//# sourceMappingURL=a.bundle.js.map"));
}

#[tokio::test]
async fn export_lib_emits_registry_only() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.ts", "export const x = 1;\n");

    let ctx = context(dir.path());
    let config = r#"{"bundlerOptions":{"exportLib":true}}"#;
    let (_stats, text) = bundle(&ctx, dir.path(), config, "a.ts").await;

    assert!(text.trim_end().ends_with("module.exports = __tsb;"));
    assert!(!text.contains("module.exports=__tsb.a();"));
}

#[tokio::test]
async fn var_module_rule_wraps_in_iife() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.ts", "export const x = 1;\n");

    let ctx = context(dir.path());
    let config = r#"{"bundlerOptions":{"module":"var MyLib"}}"#;
    let (_stats, text) = bundle(&ctx, dir.path(), config, "a.ts").await;

    assert!(text.contains("var MyLib = (() => {"));
    assert!(text.contains("return __tsb.a();"));
    assert!(text.contains("})();"));
}

#[tokio::test]
async fn declaration_file_is_written_for_json_imports() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "data.json", "{\"v\":42}");
    write(
        dir.path(),
        "a.ts",
        "import d from './data.json';\nexport const v = d.v;\n",
    );

    let ctx = context(dir.path());
    let config = r#"{"compilerOptions":{"declaration":true}}"#;
    let (stats, _text) = bundle(&ctx, dir.path(), config, "a.ts").await;

    let decl_path = stats.declaration_path.expect("declaration output");
    let decl = std::fs::read_to_string(decl_path).unwrap();
    assert!(decl.contains("declare namespace __tsb {"));
    assert!(decl.contains("export const data: {\"v\":42};"));
    assert!(decl.trim_end().ends_with("export = __tsb.a;"));
}

#[tokio::test]
async fn host_globals_are_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.ts",
        "export const here = __dirname;\nexport const me = __filename;\nexport const g = global;\n",
    );

    let ctx = context(dir.path());
    let (_stats, text) = bundle(&ctx, dir.path(), "{}", "a.ts").await;

    assert!(text.contains("__tsb.__resolve("));
    // The helper pair lands in the registry when any module needs it.
    assert!(text.contains("__dirname: __dirname,"));
    assert!(text.contains("__resolve(rpath){"));
    assert!(text.contains("globalThis"));
    assert!(!text.contains("= global;"));
}

#[tokio::test]
async fn externals_globs_stay_on_the_host_loader() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.ts",
        "import * as e from 'electron';\nexport const app = e.app;\n",
    );

    let ctx = context(dir.path());
    let config = r#"{"bundlerOptions":{"externals":["electron*"]}}"#;
    let (_stats, text) = bundle(&ctx, dir.path(), config, "a.ts").await;

    // Loaded at the use site, not preimported into the registry.
    assert!(text.contains("const e = require('electron');"));
    assert!(!text.contains("electron: require"));
}

#[tokio::test]
async fn commonjs_require_is_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "b.js", "module.exports = { n: 7 };\n");
    write(
        dir.path(),
        "a.ts",
        "const b = require('./b');\nexport const n = b.n;\n",
    );

    let ctx = context(dir.path());
    let (stats, text) = bundle(&ctx, dir.path(), "{}", "a.ts").await;

    assert_eq!(stats.modules_written, 2);
    assert!(text.contains("const b = __tsb.b()"));
    // The CommonJS child keeps its module.exports shape via the wrapper.
    assert!(text.contains("const module = {exports};"));
    assert!(text.contains("return __tsb.b.exports = module.exports;"));
}
