mod archive;
mod config;
mod handlers;
mod pages;
mod query;
mod reindex;
mod store;
mod utils;
mod walker;

#[derive(Debug, thiserror::Error)]
pub(crate) enum AppError {
    #[error(transparent)]
    Query(#[from] query::QueryError),
    #[error("Invalid username or password")]
    Forbidden,
    #[error("Resource not found")]
    NotFound,
    #[error("Path traversal attempt detected")]
    PathTraversal,
    #[error("Index store error")]
    Store(#[from] rusqlite::Error),
    #[error("Internal server error")]
    Internal(#[from] std::io::Error),
    #[error("Root could not be walked")]
    Walk(#[from] walker::WalkError),
    #[error("Task execution failed")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Query(_) => axum::http::StatusCode::BAD_REQUEST,
            AppError::Forbidden => axum::http::StatusCode::FORBIDDEN,
            AppError::NotFound | AppError::PathTraversal => axum::http::StatusCode::NOT_FOUND,
            _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log_error!("API error: {:?}", &self);
            axum::response::IntoResponse::into_response((status, "Internal Server Error"))
        } else {
            log_info!("API error: {}", &self);
            axum::response::IntoResponse::into_response((status, self.to_string()))
        }
    }
}

pub(crate) struct AppState {
    roots: scc::HashMap<String, walker::MovieRoot>,
    store: std::sync::Arc<store::IndexStore>,
    pages: pages::Pages,
    stats: utils::stats::ServeStats,
}

impl AppState {
    fn new(
        roots: Vec<walker::MovieRoot>,
        store: std::sync::Arc<store::IndexStore>,
        pages: pages::Pages,
    ) -> Self {
        let registry = scc::HashMap::with_capacity(roots.len());
        for root in roots {
            let _ = registry.insert(root.key.clone(), root);
        }
        Self {
            roots: registry,
            store,
            pages,
            stats: utils::stats::ServeStats::new(),
        }
    }

    async fn root(&self, key: &str) -> Option<walker::MovieRoot> {
        self.roots.read_async(key, |_, root| root.clone()).await
    }

    /// Every configured root, ordered by key.
    fn roots(&self) -> Vec<walker::MovieRoot> {
        let mut roots = Vec::with_capacity(self.roots.len());
        self.roots.scan(|_, root| roots.push(root.clone()));
        roots.sort_by(|a, b| a.key.cmp(&b.key));
        roots
    }

    fn root_keys(&self) -> Vec<String> {
        self.roots().into_iter().map(|root| root.key).collect()
    }
}

fn router(
    state: std::sync::Arc<AppState>,
    static_dir: Option<&std::path::Path>,
) -> axum::Router {
    let mut app = axum::Router::new()
        .route("/", axum::routing::get(handlers::login_page))
        .route(
            "/checkAccess/",
            axum::routing::get(handlers::check_access).post(handlers::check_access),
        )
        .route("/main/", axum::routing::get(handlers::main_page))
        .route("/main/tableKeys/", axum::routing::get(handlers::table_keys))
        .route("/main/table/{key}", axum::routing::get(handlers::table))
        .route("/main/table/{key}/", axum::routing::get(handlers::table))
        .route("/main/movie/{key}", axum::routing::get(handlers::serve_root))
        .route("/main/movie/{key}/", axum::routing::get(handlers::serve_root))
        .route("/main/movie/{key}/{*path}", axum::routing::get(handlers::serve_entry))
        .route("/healthcheck", axum::routing::get(|| async { "OK" }));

    if let Some(dir) = static_dir {
        log_info!("Serving static assets from {:?}", dir);
        app = app.nest_service("/main/static", tower_http::services::ServeDir::new(dir));
    }

    app.with_state(state)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            log_warn!("Interrupt received, shutting down");
        }
        Err(e) => {
            log_with_context!(error, e, "Failed to listen for the interrupt signal");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    #[cfg(feature = "logging")]
    utils::logging::init();

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(config::ConfigError::NoRoots) => {
            eprintln!(
                "Usage: {} <directory-path | key=directory-path>...",
                std::env::args().next().unwrap_or("movieserver".to_owned())
            );
            std::process::exit(1);
        }
        Err(e) => {
            log_error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let roots = match config.open_roots() {
        Ok(roots) => roots,
        Err(e) => {
            log_error!("{}", e);
            std::process::exit(1);
        }
    };

    let store = match store::IndexStore::open(&config.db_path, config.refresh_schema) {
        Ok(store) => std::sync::Arc::new(store),
        Err(e) => {
            log_with_context!(error, e, "Failed to open index database {:?}", &config.db_path);
            std::process::exit(1);
        }
    };

    for (user, password) in &config.credentials {
        if let Err(e) = store.add_credential(user, password) {
            log_with_context!(error, e, "Failed to seed credentials for '{}'", user);
            std::process::exit(1);
        }
    }

    for root in &roots {
        let indexed = tokio::task::spawn_blocking({
            let root = root.clone();
            let store = store.clone();
            move || walker::index_root(&root, &store)
        })
        .await;

        match indexed {
            Ok(Ok(report)) => {
                log_info!(
                    "Indexed root '{}' at {:?}: {} entries",
                    &root.key,
                    &root.path,
                    report.present
                );
            }
            Ok(Err(e)) => {
                log_with_context!(error, e, "Initial walk of root '{}' failed", &root.key);
                std::process::exit(1);
            }
            Err(e) => {
                log_with_context!(error, e, "Initial walk of root '{}' panicked", &root.key);
                std::process::exit(1);
            }
        }
    }

    let root_keys = roots.iter().map(|root| root.key.clone()).collect();
    let pages = match pages::Pages::load(config.template_dir.as_deref(), root_keys) {
        Ok(pages) => pages,
        Err(e) => {
            log_with_context!(error, e, "Failed to load page templates");
            std::process::exit(1);
        }
    };

    let state = std::sync::Arc::new(AppState::new(roots, store, pages));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reindexer = reindex::spawn(
        state.clone(),
        config.reindex_interval,
        config.watch,
        shutdown_rx,
    );

    #[cfg(feature = "stats")]
    start_stats_logger(state.clone());

    let app = router(state, config.static_dir.as_deref());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;

    log_info!(
        "Starting server on port {} serving roots: {:?}",
        config.port,
        config.roots.iter().map(|r| &r.key).collect::<Vec<_>>()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = reindexer.await {
        log_with_context!(warn, e, "Re-indexer did not stop cleanly");
    }

    #[cfg(feature = "logging")]
    utils::logging::flush();

    Ok(())
}

#[cfg(feature = "stats")]
fn start_stats_logger(state: std::sync::Arc<AppState>) {
    const STATS_LOG_INTERVAL_SECONDS: u64 = 30;

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(STATS_LOG_INTERVAL_SECONDS));
        loop {
            interval.tick().await;
            let snapshot = state.stats.snapshot();

            log_info!(
                "Serve Statistics: Files={}, Archives={}, Rejected Logins={}",
                snapshot.files,
                snapshot.archives,
                snapshot.rejected_logins
            );
        }
    });
}
