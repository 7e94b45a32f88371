use tracing::{error, info, warn};

pub struct Logger;

impl Logger {
    pub fn init(verbose: bool) {
        let filter = if verbose { "tsbundle=debug" } else { "tsbundle=info" };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    }

    pub fn bundle_start(entry: &str, output: &str) {
        info!("bundling {} -> {}", entry, output);
    }

    pub fn module_refined(rpath: &str, from_cache: bool) {
        if from_cache {
            tracing::debug!("cached  {}", rpath);
        } else {
            tracing::debug!("refined {}", rpath);
        }
    }

    pub fn bundle_complete(output: &str, modules: usize, refined: usize, elapsed_ms: u128) {
        info!(
            "{}: {} modules ({} refined) in {}ms",
            output, modules, refined, elapsed_ms
        );
    }

    pub fn error(msg: &str) {
        error!("{}", msg);
    }

    pub fn warn(msg: &str) {
        warn!("{}", msg);
    }

    pub fn info(msg: &str) {
        info!("{}", msg);
    }
}
