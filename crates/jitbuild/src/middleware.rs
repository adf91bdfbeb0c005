//! HTTP request middleware.
//!
//! Adapts one request under the mount prefix to one build session. The
//! session runs on its own task, so a client going away never interrupts a
//! compile or a publish.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use jitbuild_compiler::Compiler;

use crate::error::ProtocolError;
use crate::protocol::{Protocol, ProtocolConfig};
use crate::session::{Delivery, Outcome};

/// The parts of a request resolvers get to see.
#[derive(Debug, Clone)]
pub struct AssetRequest {
    pub method: Method,
    pub uri: Uri,
    /// Percent-decoded request path with the mount prefix removed, without a
    /// leading `/`.
    pub path: String,
    pub headers: HeaderMap,
}

impl AssetRequest {
    pub fn new(method: Method, uri: Uri, path: impl Into<String>) -> Self {
        Self {
            method,
            uri,
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }

    /// The mount-relative path as a relative filesystem path.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

/// Builds the response for a failed session.
pub type ErrorResponder =
    Arc<dyn Fn(&ProtocolError, &AssetRequest) -> Response<Full<Bytes>> + Send + Sync>;

/// Builds the response for a missing source.
pub type NotFoundResponder = Arc<dyn Fn(&AssetRequest) -> Response<Full<Bytes>> + Send + Sync>;

/// Middleware configuration.
pub struct MiddlewareConfig {
    /// URL prefix the middleware answers under.
    pub mount: String,
    pub protocol: ProtocolConfig<AssetRequest>,
    pub error_response: ErrorResponder,
    pub not_found_response: NotFoundResponder,
}

impl MiddlewareConfig {
    /// Mount at `/` with the given source and destination resolvers.
    pub fn new<S, D>(source: S, dest: D) -> Self
    where
        S: Fn(&AssetRequest) -> Result<PathBuf, ProtocolError> + Send + Sync + 'static,
        D: Fn(&AssetRequest) -> Result<PathBuf, ProtocolError> + Send + Sync + 'static,
    {
        Self::from_protocol(ProtocolConfig::new(source, dest))
    }

    pub fn from_protocol(protocol: ProtocolConfig<AssetRequest>) -> Self {
        Self {
            mount: "/".to_string(),
            protocol,
            error_response: Arc::new(default_error_response),
            not_found_response: Arc::new(default_not_found_response),
        }
    }

    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into();
        self
    }

    pub fn with_protocol(
        mut self,
        f: impl FnOnce(ProtocolConfig<AssetRequest>) -> ProtocolConfig<AssetRequest>,
    ) -> Self {
        self.protocol = f(self.protocol);
        self
    }

    pub fn with_error_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProtocolError, &AssetRequest) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        self.error_response = Arc::new(f);
        self
    }

    pub fn with_not_found_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&AssetRequest) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        self.not_found_response = Arc::new(f);
        self
    }
}

/// Serves compiled assets.
#[derive(Clone)]
pub struct AssetMiddleware {
    protocol: Arc<Protocol<AssetRequest>>,
    mount: String,
    error_response: ErrorResponder,
    not_found_response: NotFoundResponder,
}

impl AssetMiddleware {
    pub fn new(compiler: Compiler, config: MiddlewareConfig) -> Self {
        Self {
            protocol: Arc::new(Protocol::new(compiler, config.protocol)),
            mount: normalize_mount(&config.mount),
            error_response: config.error_response,
            not_found_response: config.not_found_response,
        }
    }

    pub fn protocol(&self) -> &Protocol<AssetRequest> {
        &self.protocol
    }

    /// Strip the mount prefix from `path`. `None` when the path lies outside
    /// the mount.
    pub fn strip_mount<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.mount.as_str())?;
        if self.mount.ends_with('/') {
            return Some(rest);
        }
        match rest {
            "" => Some(""),
            _ => rest.strip_prefix('/'),
        }
    }

    /// Handle a request, or return `None` to pass it on.
    ///
    /// Only `GET` and `HEAD` under the mount prefix are handled.
    pub async fn handle<B>(&self, req: &Request<B>) -> Option<Response<Full<Bytes>>> {
        if !matches!(*req.method(), Method::GET | Method::HEAD) {
            return None;
        }
        let path = self.strip_mount(req.uri().path())?;
        // Decoded before confinement; a decoded `..` is still caught there.
        let Ok(path) = urlencoding::decode(path) else {
            return Some(status_response(StatusCode::BAD_REQUEST, "Bad Request"));
        };
        let request = AssetRequest {
            method: req.method().clone(),
            uri: req.uri().clone(),
            path: path.into_owned(),
            headers: req.headers().clone(),
        };
        Some(self.serve(request).await)
    }

    /// Run one session for `request` and build its response.
    pub async fn serve(&self, request: AssetRequest) -> Response<Full<Bytes>> {
        let (delivery, served) = Delivery::channel();
        let protocol = Arc::clone(&self.protocol);
        let input = request.clone();
        let session = tokio::spawn(async move { protocol.run(&input, delivery).await });

        if let Ok(served) = served.await {
            let head = request.method == Method::HEAD;
            return body_response(served.body, served.content_type, head);
        }

        // Nothing was delivered: the session was forbidden or failed.
        match session.await {
            Ok(Ok(session)) if session.outcome == Some(Outcome::Forbidden) => {
                status_response(StatusCode::FORBIDDEN, "Forbidden")
            }
            Ok(Ok(session)) => {
                tracing::warn!(outcome = ?session.outcome, "session finished without a body");
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
            Ok(Err(err)) if err.is_not_found() => (self.not_found_response)(&request),
            Ok(Err(err)) => (self.error_response)(&err, &request),
            Err(e) => {
                tracing::error!(error = %e, "build session task failed");
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

fn normalize_mount(mount: &str) -> String {
    let trimmed = mount.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn body_response(body: Bytes, content_type: Option<&str>, head: bool) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_LENGTH, body.len());
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    let body = if head { Bytes::new() } else { body };
    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Plain-text response with the given status.
pub fn status_response(status: StatusCode, text: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(text.into())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// 400 with the error text.
pub fn default_error_response(err: &ProtocolError, _req: &AssetRequest) -> Response<Full<Bytes>> {
    status_response(StatusCode::BAD_REQUEST, err.to_string())
}

pub fn default_not_found_response(_req: &AssetRequest) -> Response<Full<Bytes>> {
    status_response(StatusCode::NOT_FOUND, "Not Found")
}
