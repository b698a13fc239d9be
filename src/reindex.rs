const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

type Watcher = notify_debouncer_full::Debouncer<
    notify_debouncer_full::notify::RecommendedWatcher,
    notify_debouncer_full::RecommendedCache,
>;

/// Whether any component of `relative` would be skipped by the walker.
fn is_hidden(relative: &std::path::Path) -> bool {
    relative
        .components()
        .any(|c| c.as_os_str().as_encoded_bytes().first() == Some(&b'.'))
}

/// Keys of the roots affected by `events`. Changes confined to dot entries are ignored
/// because the walker never indexes them.
pub fn roots_touched(
    roots: &[crate::walker::MovieRoot],
    events: &[notify_debouncer_full::DebouncedEvent],
) -> std::collections::BTreeSet<String> {
    let mut touched = std::collections::BTreeSet::new();

    for event in events {
        crate::log_trace!("file watch event info: {:?}", event);

        if event.need_rescan() {
            crate::log_warn!("file watch rescan flag received, re-walking every root");
            touched.extend(roots.iter().map(|r| r.key.clone()));
            continue;
        }
        if event.kind.is_access() {
            continue;
        }

        for path in &event.paths {
            for root in roots {
                match path.strip_prefix(&root.path) {
                    Ok(relative) if !is_hidden(relative) => {
                        touched.insert(root.key.clone());
                    }
                    _ => {}
                }
            }
        }
    }

    touched
}

fn start_watcher(
    roots: Vec<crate::walker::MovieRoot>,
    tx: tokio::sync::mpsc::UnboundedSender<String>,
) -> Option<Watcher> {
    let watched = roots.clone();
    let debouncer = notify_debouncer_full::new_debouncer(
        DEBOUNCE,
        None,
        move |result: notify_debouncer_full::DebounceEventResult| match result {
            Ok(events) => {
                for key in roots_touched(&watched, &events) {
                    let _ = tx.send(key);
                }
            }
            Err(errors) => {
                for e in errors {
                    crate::log_with_context!(warn, e, "File watch error");
                }
            }
        },
    );

    let mut debouncer = match debouncer {
        Ok(debouncer) => debouncer,
        Err(e) => {
            crate::log_with_context!(error, e, "Could not start the file watcher, relying on periodic re-walks");
            return None;
        }
    };

    for root in &roots {
        if let Err(e) = debouncer.watch(&root.path, notify_debouncer_full::notify::RecursiveMode::Recursive) {
            crate::log_with_context!(warn, e, "Could not watch root '{}' at {:?}", &root.key, &root.path);
        }
    }

    Some(debouncer)
}

/// Re-walks the named roots one after another on the blocking pool.
pub async fn reindex(state: &std::sync::Arc<crate::AppState>, keys: &std::collections::BTreeSet<String>) {
    for key in keys {
        let Some(root) = state.root(key).await else {
            continue;
        };
        let store = state.store.clone();
        let result = tokio::task::spawn_blocking(move || crate::walker::index_root(&root, &store)).await;
        match result {
            Ok(Ok(report)) => {
                if report.added > 0 || report.removed > 0 {
                    crate::log_info!(
                        "Re-indexed root '{}': {} added, {} removed, {} present",
                        key,
                        report.added,
                        report.removed,
                        report.present
                    );
                }
            }
            Ok(Err(e)) => {
                crate::log_with_context!(error, e, "Re-indexing root '{}' failed, keeping the previous index", key);
            }
            Err(e) => {
                crate::log_with_context!(error, e, "Re-indexing task for root '{}' panicked", key);
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Runs until `shutdown` flips. The initial walk has already happened, so the first periodic
/// pass is one full interval away.
pub fn spawn(
    state: std::sync::Arc<crate::AppState>,
    interval: Option<std::time::Duration>,
    watch: bool,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let roots = state.roots();
        let all_keys: std::collections::BTreeSet<String> =
            roots.iter().map(|r| r.key.clone()).collect();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let _watcher = if watch {
            start_watcher(roots, tx.clone())
        } else {
            None
        };

        let mut ticker = interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        crate::log_info!(
            "Re-indexer started (interval: {:?}, watching: {})",
            interval,
            _watcher.is_some()
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = next_tick(&mut ticker) => {
                    reindex(&state, &all_keys).await;
                }
                Some(key) = rx.recv() => {
                    let mut keys = std::collections::BTreeSet::from([key]);
                    while let Ok(key) = rx.try_recv() {
                        keys.insert(key);
                    }
                    crate::log_debug!("File changes under {:?}, re-indexing", &keys);
                    reindex(&state, &keys).await;
                }
            }
        }

        drop(tx);
        crate::log_info!("Re-indexer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(
        kind: notify_debouncer_full::notify::EventKind,
        path: &std::path::Path,
    ) -> notify_debouncer_full::DebouncedEvent {
        notify_debouncer_full::DebouncedEvent {
            event: notify_debouncer_full::notify::Event::new(kind).add_path(path.to_path_buf()),
            time: std::time::Instant::now(),
        }
    }

    fn roots() -> Vec<crate::walker::MovieRoot> {
        vec![
            crate::walker::MovieRoot {
                key: "movie".to_owned(),
                path: "/srv/movies".into(),
            },
            crate::walker::MovieRoot {
                key: "tv".to_owned(),
                path: "/srv/tv".into(),
            },
        ]
    }

    #[test]
    fn events_map_to_their_roots() {
        use notify_debouncer_full::notify::{event::CreateKind, event::AccessKind, EventKind};

        let events = vec![
            event(
                EventKind::Create(CreateKind::File),
                std::path::Path::new("/srv/tv/show/e01.mkv"),
            ),
            event(
                EventKind::Access(AccessKind::Any),
                std::path::Path::new("/srv/movies/a.mkv"),
            ),
            event(
                EventKind::Create(CreateKind::File),
                std::path::Path::new("/srv/movies/.partial/a.mkv"),
            ),
            event(
                EventKind::Create(CreateKind::File),
                std::path::Path::new("/elsewhere/file"),
            ),
        ];

        let touched = roots_touched(&roots(), &events);
        assert_eq!(touched.into_iter().collect::<Vec<_>>(), vec!["tv".to_owned()]);
    }

    #[tokio::test]
    async fn reindex_picks_up_new_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("first.mkv"), b"1").expect("write");
        let state = crate::tests::state_for(&[("movie", dir.path())]);

        assert_eq!(
            state.store.lookup("movie", "second.mkv").expect("lookup"),
            None
        );
        std::fs::write(dir.path().join("second.mkv"), b"2").expect("write");
        std::fs::remove_file(dir.path().join("first.mkv")).expect("rm");

        reindex(&state, &std::collections::BTreeSet::from(["movie".to_owned()])).await;

        assert_eq!(
            state.store.lookup("movie", "second.mkv").expect("lookup"),
            Some(crate::store::EntryKind::File)
        );
        assert_eq!(state.store.lookup("movie", "first.mkv").expect("lookup"), None);
    }

    #[tokio::test]
    async fn vanished_root_keeps_its_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let movies = dir.path().join("movies");
        std::fs::create_dir_all(movies.join("show")).expect("mkdir");
        std::fs::write(movies.join("show/e01.mkv"), b"1").expect("write");
        let state = crate::tests::state_for(&[("movie", &movies)]);
        state.store.record_download("movie", "show/e01.mkv").expect("download");

        std::fs::remove_dir_all(&movies).expect("rm");
        reindex(&state, &std::collections::BTreeSet::from(["movie".to_owned()])).await;

        assert_eq!(
            state.store.lookup("movie", "show/e01.mkv").expect("lookup"),
            Some(crate::store::EntryKind::File)
        );
        assert_eq!(
            state.store.lookup("movie", "show").expect("lookup"),
            Some(crate::store::EntryKind::Directory)
        );
        assert_eq!(state.store.downloads("movie", "show/e01.mkv").expect("downloads"), Some(1));
    }

    #[tokio::test]
    async fn spawned_task_stops_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = crate::tests::state_for(&[("movie", dir.path())]);
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = spawn(state, Some(std::time::Duration::from_secs(3600)), false, rx);
        tx.send(true).expect("send");
        handle.await.expect("join");
    }
}
