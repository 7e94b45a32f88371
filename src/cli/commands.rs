use crate::bundler::bundle_all;
use crate::cache::{DEFAULT_IDLE_EXPIRY, DEFAULT_MEMORY_BUDGET};
use crate::config::{resolve_targets, TsbConfig, CACHE_DIR_NAME};
use crate::context::MainContext;
use crate::utils::watch::{BundleWatcher, WatchConfig};
use crate::utils::{Logger, Result, TsbError};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tsbundle")]
#[command(about = "Bundle a TypeScript/JavaScript entry and its imports into one script")]
pub struct Cli {
    /// Entry source files (fall back to tsbundle.config.json)
    pub entries: Vec<String>,

    /// Output path (templates: [name], [dirname], [ENVVAR])
    #[arg(short, long)]
    pub output: Option<String>,

    /// Watch for changes and rebuild automatically
    #[arg(short, long)]
    pub watch: bool,

    /// Wipe the cache directory and exit
    #[arg(long)]
    pub clear_cache: bool,

    /// Log per-module progress
    #[arg(long)]
    pub verbose: bool,
}

pub struct CliHandler;

impl CliHandler {
    /// Parses arguments, runs the requested work and returns the process
    /// exit code: 0 on zero errors, 1 otherwise.
    pub async fn run() -> i32 {
        let cli = Cli::parse();
        match Self::run_with(cli).await {
            Ok(code) => code,
            Err(err) => {
                Logger::error(&err.report());
                1
            }
        }
    }

    async fn run_with(cli: Cli) -> Result<i32> {
        let root = std::env::current_dir().map_err(TsbError::Io)?;
        let loaded = TsbConfig::load_from_dir(&root)?;
        let (config, config_path) = match loaded {
            Some((config, path)) => (config, Some(path)),
            None => (TsbConfig::default(), None),
        };
        let verbose = cli.verbose || config.bundler_options.verbose;
        Logger::init(verbose);

        let cache_dir = root.join(CACHE_DIR_NAME);
        let memory_budget = match &config.bundler_options.cache_memory {
            Some(size) => size.bytes()?,
            None => DEFAULT_MEMORY_BUDGET,
        };
        let ctx = MainContext::new(cache_dir, memory_budget, DEFAULT_IDLE_EXPIRY);

        if cli.clear_cache {
            ctx.clear_cache().await?;
            Logger::info("cache cleared");
            return Ok(0);
        }

        let targets = resolve_targets(
            &root,
            &config,
            config_path.as_deref(),
            &cli.entries,
            cli.output.as_deref(),
        )?;

        if cli.watch {
            let watcher = BundleWatcher::new(
                ctx.clone(),
                targets,
                WatchConfig {
                    root: root.clone(),
                    debounce_ms: config.bundler_options.watch_waiting,
                    verbose,
                },
            );
            watcher.watch().await?;
        } else {
            bundle_all(ctx.clone(), targets).await;
        }

        ctx.flush_registry_sync();
        Ok(if ctx.error_count() == 0 { 0 } else { 1 })
    }
}
