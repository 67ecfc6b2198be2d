use std::fs;
use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::get};
use tracing::{error, info};
use uuid::Uuid;

use capstan_common::{CapstanError, Result, ShuffleConfig, ShuffleId};

use crate::layout::{block_count_rel_path, block_rel_path, map_task_rel_dir};

const LOCAL_DIR_ATTEMPTS: u32 = 10;

/// The local shuffle store: a per-process directory holding block files and
/// the read-only fetch endpoint advertising it.
///
/// Files live for the lifetime of the directory; cleanup happens externally
/// when the process exits.
#[derive(Debug)]
pub struct ShuffleStore {
    root: PathBuf,
    server_uri: String,
}

static STORE: OnceLock<ShuffleStore> = OnceLock::new();
static STORE_INIT: Mutex<()> = Mutex::new(());

/// Returns the process-wide store, initializing it from `config` on the
/// first call. Later calls ignore `config`.
///
/// Initialization failure is unrecoverable for the process; callers
/// propagate it fatally.
pub fn global_store(config: &ShuffleConfig) -> Result<&'static ShuffleStore> {
    if let Some(store) = STORE.get() {
        return Ok(store);
    }
    let _guard = STORE_INIT
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(store) = STORE.get() {
        return Ok(store);
    }
    let store = ShuffleStore::initialize(config)?;
    Ok(STORE.get_or_init(|| store))
}

impl ShuffleStore {
    /// Creates a uniquely named shuffle directory under `config.local_dir`
    /// and binds the fetch endpoint.
    ///
    /// With the default configuration an embedded static server is started
    /// on an ephemeral local port; with `external_server_port >= 0` the
    /// externally visible URI is computed instead and no server is spawned.
    pub fn initialize(config: &ShuffleConfig) -> Result<Self> {
        config.validate()?;
        let root = create_local_dir(Path::new(&config.local_dir))?;
        fs::create_dir_all(root.join("shuffle"))?;

        let server_uri = if config.uses_external_server() {
            let prefix = normalize_path_prefix(&config.external_server_path);
            format!(
                "http://{}:{}{}",
                config.server_host, config.external_server_port, prefix
            )
        } else {
            spawn_embedded_server(root.clone())?
        };
        info!(root = %root.display(), server_uri = %server_uri, "shuffle store initialized");
        Ok(Self { root, server_uri })
    }

    /// Directory all shuffle files live beneath.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Externally visible base URI of the fetch endpoint.
    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    pub fn block_path(
        &self,
        shuffle: ShuffleId,
        map_id: usize,
        reduce: usize,
        seq: usize,
    ) -> PathBuf {
        self.root.join(block_rel_path(shuffle, map_id, reduce, seq))
    }

    pub fn block_count_path(&self, shuffle: ShuffleId, map_id: usize, reduce: usize) -> PathBuf {
        self.root.join(block_count_rel_path(shuffle, map_id, reduce))
    }

    /// Creates the per-map-task directory. Idempotent.
    pub fn ensure_map_task_dir(&self, shuffle: ShuffleId, map_id: usize) -> Result<PathBuf> {
        let dir = self.root.join(map_task_rel_dir(shuffle, map_id));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn create_local_dir(base: &Path) -> Result<PathBuf> {
    fs::create_dir_all(base)?;
    let mut last_err = None;
    for _ in 0..LOCAL_DIR_ATTEMPTS {
        let candidate = base.join(format!("capstan-{}", Uuid::new_v4()));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) => last_err = Some(e),
        }
    }
    Err(CapstanError::InvalidConfig(format!(
        "failed to create a local shuffle directory under {} after {LOCAL_DIR_ATTEMPTS} attempts: {}",
        base.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn normalize_path_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.starts_with('/') {
        prefix.trim_end_matches('/').to_string()
    } else {
        format!("/{}", prefix.trim_end_matches('/'))
    }
}

fn spawn_embedded_server(root: PathBuf) -> Result<String> {
    let listener = StdTcpListener::bind(("127.0.0.1", 0))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    thread::Builder::new()
        .name("capstan-fetch-server".to_string())
        .spawn(move || serve_blocking(listener, root))?;

    info!(%addr, "embedded shuffle fetch server listening");
    Ok(format!("http://{addr}"))
}

// Runs on a detached daemon thread for the remainder of the process.
fn serve_blocking(listener: StdTcpListener, root: PathBuf) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("fetch server runtime init failed: {e}");
            return;
        }
    };
    rt.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                error!("fetch server listener registration failed: {e}");
                return;
            }
        };
        let app = Router::new()
            .route("/shuffle/*rest", get(serve_shuffle_file))
            .with_state(Arc::new(root));
        if let Err(e) = axum::serve(listener, app).await {
            error!("fetch server terminated: {e}");
        }
    });
}

async fn serve_shuffle_file(
    State(root): State<Arc<PathBuf>>,
    UrlPath(rest): UrlPath<String>,
) -> Response {
    if rest
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = root.join("shuffle").join(&rest);
    match tokio::fs::read(&path).await {
        Ok(bytes) => bytes.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use capstan_common::{ShuffleConfig, ShuffleId};

    use super::ShuffleStore;

    fn temp_local_dir() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("capstan_store_test_{nanos}"))
    }

    fn test_config(local_dir: &PathBuf) -> ShuffleConfig {
        ShuffleConfig {
            local_dir: local_dir.to_string_lossy().into_owned(),
            ..ShuffleConfig::default()
        }
    }

    #[test]
    fn initializes_unique_directory_and_serves_files() {
        let base = temp_local_dir();
        let store = ShuffleStore::initialize(&test_config(&base)).expect("store");
        assert!(store.root().starts_with(&base));
        assert!(store.root().join("shuffle").is_dir());
        assert!(store.server_uri().starts_with("http://127.0.0.1:"));

        let shuffle = ShuffleId(900);
        store.ensure_map_task_dir(shuffle, 0).expect("map dir");
        let path = store.block_path(shuffle, 0, 1, 0);
        fs::write(&path, b"block bytes").expect("write block");

        let url = crate::layout::block_url(store.server_uri(), shuffle, 0, 1, 0);
        let body = reqwest::blocking::get(&url).expect("get").bytes().expect("body");
        assert_eq!(&body[..], b"block bytes");

        let missing = crate::layout::block_url(store.server_uri(), shuffle, 0, 1, 9);
        let status = reqwest::blocking::get(&missing).expect("get").status();
        assert_eq!(status.as_u16(), 404);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn rejects_parent_traversal_components() {
        let base = temp_local_dir();
        let store = ShuffleStore::initialize(&test_config(&base)).expect("store");

        let url = format!("{}/shuffle/..%2Fsecrets", store.server_uri());
        let status = reqwest::blocking::get(&url).expect("get").status();
        assert!(status.is_client_error(), "got {status}");

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn external_server_mode_computes_uri_without_binding() {
        let base = temp_local_dir();
        let config = ShuffleConfig {
            external_server_port: 8040,
            external_server_path: "data/shuffle-root".to_string(),
            server_host: "producer-7.example".to_string(),
            ..test_config(&base)
        };
        let store = ShuffleStore::initialize(&config).expect("store");
        assert_eq!(
            store.server_uri(),
            "http://producer-7.example:8040/data/shuffle-root"
        );

        let _ = fs::remove_dir_all(base);
    }
}
