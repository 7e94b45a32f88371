// Watch mode: monitors the project tree and re-bundles on change.

use crate::bundler::bundle_target;
use crate::config::BundleTarget;
use crate::context::MainContext;
use crate::utils::{Logger, Result, TsbError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_DEBOUNCE_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub root: PathBuf,
    /// `bundlerOptions.watchWaiting`.
    pub debounce_ms: Option<u64>,
    pub verbose: bool,
}

pub struct BundleWatcher {
    ctx: Arc<MainContext>,
    targets: Vec<BundleTarget>,
    config: WatchConfig,
}

impl BundleWatcher {
    pub fn new(ctx: Arc<MainContext>, targets: Vec<BundleTarget>, config: WatchConfig) -> Self {
        Self {
            ctx,
            targets,
            config,
        }
    }

    pub async fn watch(&self) -> Result<()> {
        Logger::info("watch mode started; press Ctrl+C to stop");

        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| TsbError::config(format!("failed to create watcher: {}", e)))?;
        watcher
            .watch(&self.config.root, RecursiveMode::Recursive)
            .map_err(|e| {
                TsbError::config(format!(
                    "failed to watch {}: {}",
                    self.config.root.display(),
                    e
                ))
            })?;

        self.rebuild().await;
        self.process_events(rx).await
    }

    async fn process_events(&self, rx: Receiver<Event>) -> Result<()> {
        let debounce =
            Duration::from_millis(self.config.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS));
        let mut changed = HashSet::new();
        let mut last_change = Instant::now();

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(()).await;
        });

        loop {
            if shutdown_rx.try_recv().is_ok() {
                Logger::info("stopping watch mode");
                self.ctx.flush_registry_sync();
                break;
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => {
                    if self.should_ignore(&event) {
                        continue;
                    }
                    for path in &event.paths {
                        if is_source_file(path) {
                            changed.insert(path.clone());
                            last_change = Instant::now();
                            if self.config.verbose {
                                Logger::info(&format!("changed: {}", path.display()));
                            }
                        }
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if !changed.is_empty() && last_change.elapsed() >= debounce {
                        for path in changed.drain() {
                            // Stale artifacts drop from the memory cache so
                            // the rebuild re-reads them.
                            self.expire_changed(&path);
                        }
                        self.rebuild().await;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    Logger::warn("watch channel disconnected");
                    break;
                }
            }
        }
        Ok(())
    }

    fn expire_changed(&self, path: &Path) {
        let apath = path.display().to_string().replace('\\', "/");
        for target in &self.targets {
            let output_key = target.output.display().to_string().replace('\\', "/");
            if let Some(id) = self.ctx.known_module_id(&output_key, &apath) {
                self.ctx.memory_cache().lock().expire(id.integer_id);
            }
        }
    }

    async fn rebuild(&self) {
        let started = Instant::now();
        for target in &self.targets {
            match bundle_target(self.ctx.clone(), target.clone()).await {
                Ok(stats) => {
                    if self.config.verbose {
                        Logger::info(&format!(
                            "{}: {} modules, {} refined",
                            stats.output_path.display(),
                            stats.modules_written,
                            stats.refined_count
                        ));
                    }
                }
                Err(err) => self.ctx.report(&err),
            }
        }
        Logger::info(&format!(
            "rebuilt in {}ms",
            started.elapsed().as_millis()
        ));
    }

    fn should_ignore(&self, event: &Event) -> bool {
        match &event.kind {
            EventKind::Access(_) | EventKind::Other => true,
            _ => event.paths.iter().any(|p| {
                let text = p.to_string_lossy();
                text.contains(".git")
                    || text.contains("node_modules/.")
                    || text.contains(".tsbundle-cache")
                    || text.ends_with('~')
                    || text.ends_with(".swp")
                    || self.is_own_output(p)
            }),
        }
    }

    fn is_own_output(&self, path: &Path) -> bool {
        self.targets.iter().any(|t| {
            t.output == path
                || path
                    .to_str()
                    .is_some_and(|p| p.ends_with(".map") || p.ends_with(".bundle.d.ts"))
        })
    }
}

fn is_source_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("js" | "jsx" | "ts" | "tsx" | "json" | "mjs" | "cjs")
    )
}
