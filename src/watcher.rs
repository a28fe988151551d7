//! File-change watcher: observes configured source paths and triggers a
//! graceful restart when something under them changes, debounced so a burst
//! of writes produces one restart.

use crate::scheduler::ControlSignal;
use may::sync::mpsc;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default debounce window between a change and the restart it triggers.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Watch the given paths; on a change, send a restart signal after the
/// debounce window, collapsing changes that land inside it.
///
/// The returned watcher must be kept alive for the watch to stay active.
pub fn watch_paths(
    paths: &[PathBuf],
    control: mpsc::Sender<ControlSignal>,
    debounce: Duration,
) -> notify::Result<RecommendedWatcher> {
    // Generation counter: each change bumps it, and only the bump that is
    // still newest after the debounce window fires the restart.
    let generation = Arc::new(AtomicU64::new(0));

    let gen_for_events = generation.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                let this = gen_for_events.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(paths = ?event.paths, generation = this, "file change observed");

                let control = control.clone();
                let generation = gen_for_events.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(debounce);
                    if generation.load(Ordering::SeqCst) == this {
                        info!("file change settled, requesting restart");
                        let _ = control.send(ControlSignal::Restart);
                    }
                });
            }
            Err(e) => warn!(error = %e, "file watch error"),
        },
        Config::default(),
    )?;

    for path in paths {
        watcher.watch(path, RecursiveMode::Recursive)?;
        info!(path = %path.display(), "watching for changes");
    }
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn change_triggers_one_restart_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.json");
        fs::write(&file, "{}").unwrap();

        let (tx, rx) = mpsc::channel();
        let _watcher = watch_paths(
            &[dir.path().to_path_buf()],
            tx,
            Duration::from_millis(100),
        )
        .unwrap();

        // A burst of writes inside the debounce window.
        for i in 0..3 {
            fs::write(&file, format!("{{\"v\":{i}}}")).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        let mut signals = 0;
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while std::time::Instant::now() < deadline {
            if rx.try_recv().is_ok() {
                signals += 1;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(signals, 1);
    }
}
