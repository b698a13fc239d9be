type SharedState = axum::extract::State<std::sync::Arc<crate::AppState>>;

#[derive(serde::Deserialize)]
pub struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

pub async fn login_page(
    axum::extract::State(state): SharedState,
) -> axum::response::Html<String> {
    state.pages.render_login()
}

pub async fn main_page(
    axum::extract::State(state): SharedState,
) -> axum::response::Html<String> {
    state.pages.render_main()
}

/// Answers a good login with the main page itself, byte for byte.
pub async fn check_access(
    axum::extract::State(state): SharedState,
    axum::extract::Form(credentials): axum::extract::Form<Credentials>,
) -> Result<axum::response::Html<String>, crate::AppError> {
    crate::log_info!("[LOGIN] Checking access for user '{}'", &credentials.username);

    let store = state.store.clone();
    let accepted = tokio::task::spawn_blocking(move || {
        store.check_credentials(&credentials.username, &credentials.password)
    })
    .await??;

    if !accepted {
        state.stats.record_rejected_login();
        return Err(crate::AppError::Forbidden);
    }
    Ok(state.pages.render_main())
}

pub async fn table_keys(
    axum::extract::State(state): SharedState,
) -> axum::Json<Vec<String>> {
    axum::Json(state.root_keys())
}

pub async fn table(
    axum::extract::State(state): SharedState,
    axum::extract::Path(key): axum::extract::Path<String>,
    axum::extract::Query(params): axum::extract::Query<crate::query::TableParams>,
) -> Result<axum::Json<(crate::query::TableMeta, Vec<crate::query::TableRow>)>, crate::AppError> {
    crate::log_debug!("[TABLE] Handling request for root '{}': {:?}", &key, &params);

    let root = state.root(&key).await.ok_or(crate::AppError::NotFound)?;
    let query = crate::query::TableQuery::try_from(params)?;

    let store = state.store.clone();
    let page = tokio::task::spawn_blocking(move || query.run(&store, &root.key)).await??;
    crate::log_trace!(
        "[TABLE] {} of {} entries for root '{}'",
        page.rows.len(),
        page.meta.total_entries,
        &key
    );

    Ok(axum::Json((page.meta, page.rows)))
}

pub async fn serve_root(
    axum::extract::State(state): SharedState,
    axum::extract::Path(key): axum::extract::Path<String>,
) -> Result<axum::response::Response, crate::AppError> {
    serve(state, key, "").await
}

pub async fn serve_entry(
    axum::extract::State(state): SharedState,
    axum::extract::Path((key, path)): axum::extract::Path<(String, String)>,
) -> Result<axum::response::Response, crate::AppError> {
    serve(state, key, &path).await
}

/// Index name for a URL tail. Empty and `.` segments collapse, `..` is refused outright.
fn index_name(raw: &str) -> Result<String, crate::AppError> {
    let mut parts = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                crate::log_warn!("Path traversal attempt! Requested: {:?}", raw);
                return Err(crate::AppError::PathTraversal);
            }
            segment => parts.push(segment),
        }
    }

    if parts.is_empty() {
        Ok(crate::store::ROOT_NAME.to_owned())
    } else {
        Ok(parts.join("/"))
    }
}

/// Resolves an indexed name below `root`. Anything that no longer resolves to the very same
/// path (a symlink swapped in since indexing, for instance) is rejected.
async fn validate_path(
    root: &crate::walker::MovieRoot,
    name: &str,
) -> Result<std::path::PathBuf, crate::AppError> {
    let requested = if name == crate::store::ROOT_NAME {
        root.path.clone()
    } else {
        root.path.join(name)
    };
    crate::log_trace!("Constructed full requested path: {:?}", &requested);

    let canonical = tokio::fs::canonicalize(&requested).await.map_err(|e| {
        if let std::io::ErrorKind::NotFound = e.kind() {
            crate::log_info!("Indexed path vanished: {:?}", &requested);
            crate::AppError::NotFound
        } else {
            crate::log_with_context!(warn, e, "Unexpected error resolving path {:?}", &requested);
            crate::AppError::Internal(e)
        }
    })?;

    if canonical != requested || !canonical.starts_with(&root.path) {
        crate::log_warn!(
            "Path escapes its root! Base: {:?}, Attempted: {:?}",
            &root.path,
            &canonical
        );
        return Err(crate::AppError::PathTraversal);
    }

    Ok(canonical)
}

fn io_to_app(e: std::io::Error) -> crate::AppError {
    if e.kind() == std::io::ErrorKind::NotFound {
        crate::AppError::NotFound
    } else {
        crate::AppError::Internal(e)
    }
}

/// `Content-Disposition` value with an ASCII fallback and the exact UTF-8 name.
fn attachment(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut encoded = String::with_capacity(file_name.len());
    for byte in file_name.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

async fn serve(
    state: std::sync::Arc<crate::AppState>,
    key: String,
    raw: &str,
) -> Result<axum::response::Response, crate::AppError> {
    crate::log_info!("[MOVIE] Handling request for '{}': {}", &key, raw);

    let root = state.root(&key).await.ok_or_else(|| {
        crate::log_debug!("Unknown root key: {}", &key);
        crate::AppError::NotFound
    })?;
    let name = index_name(raw)?;

    let kind = tokio::task::spawn_blocking({
        let store = state.store.clone();
        let (key, name) = (key.clone(), name.clone());
        move || store.lookup(&key, &name)
    })
    .await??
    .ok_or_else(|| {
        crate::log_debug!("Not in the index: {}:{}", &key, &name);
        crate::AppError::NotFound
    })?;

    let path = validate_path(&root, &name).await?;

    match kind {
        crate::store::EntryKind::File => serve_file(state, root, name, path).await,
        crate::store::EntryKind::Directory => serve_dir(state, root, name).await,
    }
}

/// Opens the file, counts the download, then streams the bytes untouched. The count is
/// settled before the first byte goes out and is not revisited if the client disconnects.
async fn serve_file(
    state: std::sync::Arc<crate::AppState>,
    root: crate::walker::MovieRoot,
    name: String,
    path: std::path::PathBuf,
) -> Result<axum::response::Response, crate::AppError> {
    let file_name = name.rsplit('/').next().unwrap_or(&name).to_owned();

    let (file, len) = tokio::task::spawn_blocking({
        let store = state.store.clone();
        let name = name.clone();
        move || -> Result<_, crate::AppError> {
            let file = std::fs::File::open(&path).map_err(|e| {
                crate::log_with_context!(warn, e, "Failed to open file {:?}", &path);
                io_to_app(e)
            })?;
            let metadata = file.metadata()?;
            if !metadata.is_file() {
                crate::log_warn!("Indexed file {:?} is no longer a regular file", &path);
                return Err(crate::AppError::Internal(std::io::Error::other(
                    "indexed file is no longer a regular file",
                )));
            }
            if !store.record_download(&root.key, &name)? {
                return Err(crate::AppError::NotFound);
            }
            Ok((file, metadata.len()))
        }
    })
    .await??;

    state.stats.record_file();
    let body = crate::archive::stream_body(format!("file {name}"), move |out| {
        crate::archive::copy_file(file, len, out)
    });

    Ok(axum::response::IntoResponse::into_response((
        [
            (axum::http::header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (axum::http::header::CONTENT_LENGTH, len.to_string()),
            (axum::http::header::CONTENT_DISPOSITION, attachment(&file_name)),
        ],
        body,
    )))
}

/// Streams a tar of the directory's indexed files. Counters are left alone.
async fn serve_dir(
    state: std::sync::Arc<crate::AppState>,
    root: crate::walker::MovieRoot,
    name: String,
) -> Result<axum::response::Response, crate::AppError> {
    let files = tokio::task::spawn_blocking({
        let store = state.store.clone();
        let (key, name) = (root.key.clone(), name.clone());
        move || store.files_under(&key, &name)
    })
    .await??;

    let archive = crate::archive::DirArchive::new(&root, &name, files);
    let file_name = archive.file_name();
    crate::log_debug!(
        "Archiving {} files of {}:{} as {}",
        archive.members.len(),
        &root.key,
        &name,
        &file_name
    );

    state.stats.record_archive();
    let body = crate::archive::stream_body(format!("archive {file_name}"), move |out| {
        archive.write_to(out).map(|_| ())
    });

    Ok(axum::response::IntoResponse::into_response((
        [
            (axum::http::header::CONTENT_TYPE, "application/x-tar".to_owned()),
            (axum::http::header::CONTENT_DISPOSITION, attachment(&file_name)),
        ],
        body,
    )))
}
