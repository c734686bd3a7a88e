//! Debounced inventory reloading.
//!
//! Watches the inventory directory recursively and reloads the replayer
//! when files change. Reloads are debounced: at most one per 100 ms window,
//! with a pending flag polled by a 200 ms tick so a burst of events (an
//! editor save, an rsync) collapses into a single reload at the end.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ProxyError, Result};
use crate::replayer::Replayer;

/// Minimum spacing between two reloads.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
/// How often the pending flag is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Starts watching `inventory_dir` and reloading `replayer` on changes.
///
/// The watcher lives until `shutdown` fires or the process exits. Returns
/// the task handle for callers that want to await termination.
pub fn watch_inventory(
    inventory_dir: &Path,
    replayer: Arc<Replayer>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(e) => tracing::error!(error = %e, "file watcher error"),
        }
    })
    .map_err(|e| ProxyError::Watcher(e.to_string()))?;

    watcher
        .watch(inventory_dir, RecursiveMode::Recursive)
        .map_err(|e| ProxyError::Watcher(e.to_string()))?;

    tracing::info!(dir = %inventory_dir.display(), "watching inventory for changes");

    let handle = tokio::spawn(async move {
        // Moved in so the watcher keeps running as long as the task does.
        let _watcher = watcher;

        let mut last_reload = Instant::now()
            .checked_sub(DEBOUNCE_WINDOW)
            .unwrap_or_else(Instant::now);
        let mut pending = false;
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                maybe_event = event_rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    if is_relevant(&event) {
                        attempt_reload(&replayer, &mut last_reload, &mut pending);
                    }
                }
                _ = tick.tick() => {
                    if pending && last_reload.elapsed() >= DEBOUNCE_WINDOW {
                        attempt_reload(&replayer, &mut last_reload, &mut pending);
                    }
                }
            }
        }
        tracing::debug!("inventory watcher stopped");
    });

    Ok(handle)
}

/// Write/create/remove events on non-hidden files schedule a reload.
fn is_relevant(event: &Event) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event.paths.iter().any(|path| {
        path.file_name()
            .map(|name| !name.to_string_lossy().starts_with('.'))
            .unwrap_or(false)
    })
}

/// Reloads now if the window has elapsed, otherwise marks a reload pending.
fn attempt_reload(replayer: &Replayer, last_reload: &mut Instant, pending: &mut bool) {
    if last_reload.elapsed() < DEBOUNCE_WINDOW {
        *pending = true;
        return;
    }

    match replayer.reload() {
        Ok(count) => tracing::info!(resource_count = count, "inventory reloaded"),
        Err(e) => tracing::error!(error = %e, "failed to reload inventory"),
    }
    *last_reload = Instant::now();
    *pending = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use lyrebird_core::types::{Inventory, Resource};
    use tempfile::TempDir;

    fn write_inventory(dir: &Path, body: &str) {
        let inventory = Inventory {
            entry_url: None,
            device_type: None,
            domains: Vec::new(),
            resources: vec![Resource {
                method: "GET".into(),
                url: "http://h/a.txt".into(),
                status_code: Some(200),
                content_utf8: Some(body.into()),
                ..Default::default()
            }],
        };
        fs::write(
            dir.join("inventory.json"),
            serde_json::to_vec_pretty(&inventory).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn hidden_files_are_ignored() {
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![Path::new("/inv/.inventory.json.swp").to_path_buf()],
            attrs: Default::default(),
        };
        assert!(!is_relevant(&event));

        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![Path::new("/inv/inventory.json").to_path_buf()],
            attrs: Default::default(),
        };
        assert!(is_relevant(&event));
    }

    #[test]
    fn access_events_are_ignored() {
        let event = Event {
            kind: EventKind::Access(notify::event::AccessKind::Any),
            paths: vec![Path::new("/inv/inventory.json").to_path_buf()],
            attrs: Default::default(),
        };
        assert!(!is_relevant(&event));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_change_triggers_reload_within_a_second() {
        let dir = TempDir::new().unwrap();
        write_inventory(dir.path(), "A");

        let replayer = Replayer::new(dir.path()).unwrap();
        assert_eq!(
            replayer
                .lookup("GET:http://h/a.txt")
                .unwrap()
                .chunks[0]
                .bytes
                .as_ref(),
            b"A"
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle =
            watch_inventory(dir.path(), replayer.clone(), shutdown_tx.subscribe()).unwrap();

        // Replace the body on disk; the watcher should pick it up.
        write_inventory(dir.path(), "B");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let current = replayer
                .lookup("GET:http://h/a.txt")
                .unwrap()
                .chunks
                .first()
                .map(|c| c.bytes.clone());
            if current.as_deref() == Some(b"B".as_slice()) {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "inventory was not reloaded in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_stops_the_watcher() {
        let dir = TempDir::new().unwrap();
        let replayer = Replayer::new(dir.path()).unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle =
            watch_inventory(dir.path(), replayer, shutdown_tx.subscribe()).unwrap();

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }
}
