//! TestServer: in-process middleware test harness.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use jitbuild_compiler::{Compiler, CompilerConfig};
use jitbuild_lib::{status_response, AssetMiddleware, AssetRequest, MiddlewareConfig, RootPolicy};

use crate::engine::StubEngine;

/// URL prefix the test server mounts the middleware under.
pub const MOUNT: &str = "/assets";

/// Errors from TestServer operations.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Absolute path to the shared fixture sources.
pub fn fixtures() -> PathBuf {
    // CARGO_MANIFEST_DIR = .../crates/jitbuild-test
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../tests/fixtures")
}

/// Copy every fixture source into `dir`.
pub fn copy_fixtures(dir: &Path) -> Result<(), TestError> {
    std::fs::create_dir_all(dir)?;
    for entry in std::fs::read_dir(fixtures().join("data"))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), dir.join(entry.file_name()))?;
        }
    }
    Ok(())
}

/// Serves the fixture sources through [`AssetMiddleware`] on a random port.
///
/// Sources live in `<tmp>/src`, artifacts in `<tmp>/cache`. Requests under
/// [`MOUNT`] map onto both by their relative path.
pub struct TestServer {
    port: u16,
    client: reqwest::Client,
    engine: Arc<StubEngine>,
    task: JoinHandle<()>,
    /// Temp directory holding sources and cache (kept alive for the test duration).
    dir: TempDir,
}

impl TestServer {
    /// Start with the default middleware configuration.
    pub async fn start() -> Result<Self, TestError> {
        Self::start_with(StubEngine::new(), |config| config).await
    }

    /// Start with a custom engine and middleware configuration.
    pub async fn start_with(
        engine: StubEngine,
        configure: impl FnOnce(MiddlewareConfig) -> MiddlewareConfig,
    ) -> Result<Self, TestError> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src");
        let cache = dir.path().join("cache");
        copy_fixtures(&src)?;

        let engine = Arc::new(engine);
        let compiler = Compiler::new(engine.clone(), CompilerConfig::default());

        let source_root = src.clone();
        let config = MiddlewareConfig::new(
            move |req: &AssetRequest| Ok(source_root.join(req.relative_path())),
            move |req: &AssetRequest| Ok(cache.join(req.relative_path())),
        )
        .with_mount(MOUNT)
        .with_protocol(|p| p.with_root(RootPolicy::confined(&src)));
        let middleware = Arc::new(AssetMiddleware::new(compiler, configure(config)));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let task = tokio::spawn(serve(listener, middleware));

        Ok(Self {
            port,
            client: reqwest::Client::new(),
            engine,
            task,
            dir,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the base URL of the server.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Make a GET request for an asset, relative to the mount.
    pub async fn get(&self, asset: &str) -> Result<reqwest::Response, TestError> {
        let url = format!("{}{}/{}", self.base_url(), MOUNT, asset);
        Ok(self.client.get(&url).send().await?)
    }

    /// Make a request with any method to an absolute path.
    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::Response, TestError> {
        let url = format!("{}{}", self.base_url(), path);
        Ok(self.client.request(method, &url).send().await?)
    }

    /// Path of a source file.
    pub fn source(&self, name: &str) -> PathBuf {
        self.dir.path().join("src").join(name)
    }

    /// Path of a cached artifact.
    pub fn artifact(&self, name: &str) -> PathBuf {
        self.dir.path().join("cache").join(name)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    /// Number of builds the engine has run.
    pub fn builds(&self) -> usize {
        self.engine.builds()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: TcpListener, middleware: Arc<AssetMiddleware>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        let middleware = Arc::clone(&middleware);
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let middleware = Arc::clone(&middleware);
                async move {
                    let response: Response<Full<Bytes>> = match middleware.handle(&req).await {
                        Some(response) => response,
                        None => status_response(StatusCode::NOT_FOUND, "Not Found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            let _ = http1::Builder::new().serve_connection(io, service).await;
        });
    }
}
