use crate::config::BundleTarget;
use crate::context::MainContext;
use crate::core::interfaces::{Compiler, VirtualSystem};
use crate::core::models::{
    BundleStats, BundlerModule, CheckState, ExternalMode, ScriptKind,
};
use crate::infrastructure::file_system::{normalize_path, relative_path, RealSystem, SourceCache};
use crate::infrastructure::node_resolver::NodeModuleResolver;
use crate::infrastructure::oxc_compiler::OxcCompiler;
use crate::output::{AssembledOutput, OutputAssembler, WriterMessage};
use crate::queue::{default_concurrency, TaskQueue};
use crate::refiner::{RefineInput, RefineOutcome, Refiner};
use crate::utils::{Logger, Result, TsbError};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Items the refine queue may buffer ahead of the writer before posters
/// start awaiting drain.
const WRITER_QUEUE_DEPTH: usize = 10;

/// Walks the import graph for one entry, deduplicates modules, commits
/// refinement completions in submission order and feeds the writer queue.
pub struct Bundler {
    ctx: Arc<MainContext>,
    target: Arc<BundleTarget>,
    refiner: Arc<Refiner>,
    queue: TaskQueue,
    output_key: String,
    modules: HashMap<String, BundlerModule>,
}

impl Bundler {
    pub fn new(
        ctx: Arc<MainContext>,
        target: Arc<BundleTarget>,
        compiler: Arc<dyn Compiler>,
        system: Arc<dyn VirtualSystem>,
        queue: TaskQueue,
    ) -> Self {
        let resolver = Arc::new(NodeModuleResolver::new(
            system.clone(),
            target.options.browser,
        ));
        let sources = Arc::new(SourceCache::new(system.clone()));
        let refiner = Arc::new(Refiner::new(
            compiler,
            resolver,
            system,
            sources,
            target.clone(),
            ctx.clone(),
        ));
        let output_key = target.output.display().to_string().replace('\\', "/");
        Self {
            ctx,
            target,
            refiner,
            queue,
            output_key,
            modules: HashMap::new(),
        }
    }

    fn rpath_of(&self, apath: &str) -> String {
        let out_dir = self
            .target
            .output
            .parent()
            .unwrap_or_else(|| Path::new("."));
        relative_path(out_dir, Path::new(apath))
            .display()
            .to_string()
            .replace('\\', "/")
    }

    /// Runs one full bundle. The output path must already be claimed by the
    /// caller; errors local to modules are reported and counted, not
    /// returned.
    pub async fn bundle(mut self) -> Result<BundleStats> {
        let started = std::time::Instant::now();
        let errors_before = self.ctx.error_count();

        let entry_apath = normalize_path(&self.target.entry)
            .display()
            .to_string()
            .replace('\\', "/");
        let entry_kind = ScriptKind::from_path(Path::new(&entry_apath));
        let entry_id = self
            .ctx
            .module_id(&self.output_key, &entry_apath, entry_kind);
        Logger::bundle_start(&entry_apath, &self.output_key);

        let mut entry_module = BundlerModule::new(entry_id.clone(), entry_apath.clone());
        entry_module.is_entry = true;
        entry_module.need_declaration = self.target.declaration;
        self.modules.insert(entry_apath.clone(), entry_module);

        // Preimports configured up front are part of the prologue whether or
        // not any module references them.
        for mpath in &self.target.options.preimport {
            self.ctx
                .module_id(&self.output_key, mpath, ScriptKind::Unknown);
        }

        let (writer_tx, writer_rx) = mpsc::channel::<WriterMessage>(WRITER_QUEUE_DEPTH);
        let assembler =
            OutputAssembler::new(self.target.clone(), self.ctx.clone(), entry_id.clone());
        self.queue.add_ref();
        let writer_task = tokio::spawn(assembler.run(writer_rx));

        let mut refined_count = 0usize;
        let mut cache_hit_count = 0usize;
        let mut next_targets = vec![entry_apath.clone()];
        let mut pending: VecDeque<(String, tokio::task::JoinHandle<Option<RefineOutcome>>)> =
            VecDeque::new();

        while !next_targets.is_empty() || !pending.is_empty() {
            for apath in std::mem::take(&mut next_targets) {
                let module = self
                    .modules
                    .get_mut(&apath)
                    .ok_or_else(|| TsbError::internal("scheduled module is not in the map"))?;
                if module.is_appended {
                    continue;
                }
                module.is_appended = true;
                let input = RefineInput {
                    id: module.id.clone(),
                    is_entry: module.is_entry,
                    need_declaration: module.need_declaration,
                };
                self.queue.once_has_idle().await?;
                let refiner = self.refiner.clone();
                let name = format!("refine {}", self.rpath_of(&apath));
                let handle = self
                    .queue
                    .run(&name, async move { refiner.refine(input).await });
                pending.push_back((apath, handle));
            }

            // Commit the oldest submission; completions never reorder.
            let Some((apath, handle)) = pending.pop_front() else {
                break;
            };
            let outcome = handle
                .await
                .map_err(|err| TsbError::internal(format!("refine task panicked: {}", err)))?
                .ok_or_else(|| TsbError::Poisoned("refinement failed".to_string()))?;

            let module_id = self
                .modules
                .get(&apath)
                .map(|m| m.id.clone())
                .ok_or_else(|| TsbError::internal("refined module vanished"))?;
            match outcome.refined {
                None => {
                    let mpath = self
                        .modules
                        .get(&apath)
                        .map(|m| m.mpath.clone())
                        .unwrap_or_default();
                    writer_tx
                        .send(WriterMessage::Stub {
                            id: module_id,
                            mpath,
                        })
                        .await
                        .map_err(|_| TsbError::internal("writer queue closed early"))?;
                }
                Some(refined) => {
                    if outcome.from_cache {
                        cache_hit_count += 1;
                    } else {
                        refined_count += 1;
                    }
                    let mut children = Vec::new();
                    for import in &refined.imports {
                        match import.external_mode {
                            ExternalMode::Preimport => {
                                // Pre-register so the prologue can name it.
                                self.ctx.module_id(
                                    &self.output_key,
                                    &import.mpath,
                                    ScriptKind::Unknown,
                                );
                            }
                            ExternalMode::Manual => {}
                            ExternalMode::NoExternal => {
                                let Some(child_apath) = import.apath.clone() else {
                                    continue;
                                };
                                children.push(child_apath.clone());
                                let kind = ScriptKind::from_path(Path::new(&child_apath));
                                let child_id =
                                    self.ctx.module_id(&self.output_key, &child_apath, kind);
                                let child = self
                                    .modules
                                    .entry(child_apath.clone())
                                    .or_insert_with(|| {
                                        BundlerModule::new(child_id, import.mpath.clone())
                                    });
                                if import.declaration {
                                    child.need_declaration = true;
                                }
                                if !child.is_appended {
                                    next_targets.push(child_apath);
                                }
                            }
                        }
                    }
                    if let Some(module) = self.modules.get_mut(&apath) {
                        module.children = children;
                    }
                    writer_tx
                        .send(WriterMessage::Module {
                            id: module_id,
                            refined,
                        })
                        .await
                        .map_err(|_| TsbError::internal("writer queue closed early"))?;
                }
            }
        }

        drop(writer_tx);
        let assembled: AssembledOutput = writer_task
            .await
            .map_err(|err| TsbError::internal(format!("writer task panicked: {}", err)))??;
        self.queue.unref();
        self.queue.once_end().await?;

        if self.target.options.check_circular_dependency {
            let cycles = find_cycles(&mut self.modules);
            for cycle in cycles {
                let chain: Vec<String> = cycle.iter().map(|p| self.rpath_of(p)).collect();
                Logger::error(&format!("Circular dependency: {}", chain.join(" -> ")));
                self.ctx.count_error();
            }
        }

        // Modules that fell out of the graph release their ids and cache
        // files; preimport entries (no backing file) stay for the prologue.
        for id in self.ctx.module_ids(&self.output_key) {
            if id.kind != ScriptKind::Unknown && !self.modules.contains_key(&id.apath) {
                if let Err(err) = self.ctx.delete_module(&self.output_key, &id.apath).await {
                    Logger::warn(&format!("could not drop cache #{}: {}", id.integer_id, err));
                }
            }
        }

        self.ctx.save_registry().await;

        let stats = BundleStats {
            output_path: self.target.output.clone(),
            declaration_path: assembled.declaration_path,
            source_map_path: assembled.source_map_path,
            modules_written: assembled.modules_written,
            refined_count,
            cache_hit_count,
            error_count: self.ctx.error_count() - errors_before,
        };
        Logger::bundle_complete(
            &self.output_key,
            stats.modules_written,
            stats.refined_count,
            started.elapsed().as_millis(),
        );
        Ok(stats)
    }
}

/// Post-write DFS over the module graph; every cycle comes back as a chain
/// of absolute paths, first node repeated at the end. Detection never
/// aborts anything.
pub(crate) fn find_cycles(modules: &mut HashMap<String, BundlerModule>) -> Vec<Vec<String>> {
    let mut cycles = Vec::new();
    let mut roots: Vec<String> = modules.keys().cloned().collect();
    roots.sort();

    for root in roots {
        if modules
            .get(&root)
            .map(|m| m.check_state != CheckState::None)
            .unwrap_or(true)
        {
            continue;
        }
        // (path, next child index) frames; an explicit stack keeps nodes
        // free of ownership ties to each other.
        let mut stack: Vec<(String, usize)> = vec![(root.clone(), 0)];
        if let Some(module) = modules.get_mut(&root) {
            module.check_state = CheckState::Entered;
        }
        while let Some((path, index)) = stack.last().cloned() {
            let child = modules
                .get(&path)
                .and_then(|m| m.children.get(index).cloned());
            match child {
                None => {
                    if let Some(module) = modules.get_mut(&path) {
                        module.check_state = CheckState::Checked;
                    }
                    stack.pop();
                }
                Some(child_path) => {
                    stack.last_mut().unwrap().1 += 1;
                    let state = modules
                        .get(&child_path)
                        .map(|m| m.check_state)
                        .unwrap_or(CheckState::Checked);
                    match state {
                        CheckState::None => {
                            if let Some(module) = modules.get_mut(&child_path) {
                                module.check_state = CheckState::Entered;
                            }
                            stack.push((child_path, 0));
                        }
                        CheckState::Entered => {
                            let start = stack
                                .iter()
                                .position(|(p, _)| *p == child_path)
                                .unwrap_or(0);
                            let mut chain: Vec<String> =
                                stack[start..].iter().map(|(p, _)| p.clone()).collect();
                            chain.push(child_path);
                            cycles.push(chain);
                        }
                        CheckState::Checked => {}
                    }
                }
            }
        }
    }
    cycles
}

/// Bundles every target in order, skipping entries whose output path is
/// already taken (`Duplicated`); sibling targets keep running.
pub async fn bundle_all(ctx: Arc<MainContext>, targets: Vec<BundleTarget>) -> Vec<BundleStats> {
    let mut seen_outputs = std::collections::HashSet::new();
    let mut all = Vec::new();
    for target in targets {
        if !seen_outputs.insert(target.output.clone()) {
            ctx.report(&TsbError::Duplicated {
                output: target.output.display().to_string(),
            });
            continue;
        }
        match bundle_target(ctx.clone(), target).await {
            Ok(stats) => all.push(stats),
            Err(err) => ctx.report(&err),
        }
    }
    all
}

/// Bundles one resolved target with the default compiler and filesystem.
/// Claims the output path for the duration; a `Duplicated` claim failure is
/// returned to the caller, which skips the entry and keeps siblings alive.
pub async fn bundle_target(ctx: Arc<MainContext>, target: BundleTarget) -> Result<BundleStats> {
    let target = Arc::new(target);
    ctx.claim_output(&target.output)?;
    let queue = TaskQueue::new(default_concurrency());
    let bundler = Bundler::new(
        ctx.clone(),
        target.clone(),
        Arc::new(OxcCompiler::new()),
        Arc::new(RealSystem),
        queue,
    );
    let result = bundler.bundle().await;
    ctx.release_output(&target.output);
    result
}
