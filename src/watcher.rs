use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::FilterConfig;
use crate::filter::Filter;

/// Watch the configured rule files and hot-swap the compiled filter on
/// change. No-op when no files are configured.
pub fn spawn(filter_cfg: FilterConfig, filter: Arc<ArcSwap<Filter>>) {
    if filter_cfg.files.is_empty() {
        return;
    }
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(filter_cfg, filter) {
            error!(target = "watcher", error = %err, "rule watcher exited with error");
        }
    });
}

fn run_watcher(filter_cfg: FilterConfig, filter: Arc<ArcSwap<Filter>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    for path in &filter_cfg.files {
        watcher.watch(path, RecursiveMode::NonRecursive)?;
    }

    info!(target = "watcher", files = filter_cfg.files.len(), "rule watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // Simple retry mechanism to handle file write races (e.g. truncate+write)
                let mut retries = 3;
                while retries > 0 {
                    let (new_filter, warning) = Filter::new(&filter_cfg);
                    if warning.is_none() || !new_filter.is_empty() {
                        if let Some(warning) = warning {
                            warn!(target = "watcher", warning = %warning, "rules reloaded with warnings");
                        }
                        let count = new_filter.len();
                        filter.store(Arc::new(new_filter));
                        info!(target = "watcher", rules = count, "rules reloaded");
                        break;
                    }
                    retries -= 1;
                    if retries == 0 {
                        warn!(target = "watcher", "rule reload failed, keeping old rules");
                    } else {
                        // Wait a bit and retry
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}
