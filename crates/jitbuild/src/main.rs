//! jitbuild asset server.
//!
//! Serves compiled scripts and stylesheets on demand, or builds a set of
//! sources ahead of deployment.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{ArgAction, Parser, Subcommand};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use jitbuild_compiler::{
    AdapterOptions, BuildOptions, CommandEngine, CommandTable, Compiler, CompilerConfig,
    LogObserver, Observers,
};
use jitbuild_lib::{
    status_response, AssetMiddleware, AssetRequest, BatchCompiler, BatchConfig, Freshness,
    MetricsObserver, MiddlewareConfig, ProtocolConfig, RootPolicy, TracingReporter,
};
use jitbuild_telemetry::{
    log_listening, log_shutdown, log_startup, LogFormat, Telemetry, TelemetryConfig,
    PROMETHEUS_CONTENT_TYPE,
};

const HEALTH_PATH: &str = "/__jitbuild/health";
const METRICS_PATH: &str = "/__jitbuild/metrics";

#[derive(Parser, Debug)]
#[command(name = "jitbuild", about = "Compile-on-demand asset server", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve sources under a mount prefix, compiling them on first request.
    Serve {
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,

        /// URL prefix to serve assets under.
        #[arg(long, default_value = "/")]
        mount: String,

        /// Source root. Requests cannot resolve outside of it.
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Directory compiled artifacts are cached in.
        #[arg(long, default_value = ".jitbuild-cache")]
        cache_dir: PathBuf,

        /// Compile each source at most once; any cached artifact is served.
        #[arg(long)]
        immutable: bool,

        /// Recompile on every request.
        #[arg(long)]
        force: bool,

        /// Maximum source/artifact mtime drift in milliseconds.
        #[arg(long, default_value = "250")]
        hash_drift: u64,

        /// Minify output.
        #[arg(long)]
        minify: bool,

        /// Serve files no format handles as-is (otherwise 403).
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        serve_non_handled: bool,

        /// Log level.
        #[arg(long, default_value = "info", env = "JITBUILD_LOG_LEVEL")]
        log_level: String,

        /// Log format (json or pretty).
        #[arg(long, default_value = "json")]
        log_format: String,

        /// YAML file overriding the engine commands.
        #[arg(long)]
        engine_config: Option<PathBuf>,
    },

    /// Compile every handled glob match to `<name>.compiled.<ext>`.
    Build {
        /// Glob pattern(s) of sources to build.
        #[arg(required = true, num_args = 1..)]
        patterns: Vec<String>,

        /// Rebuild even if artifacts are fresh.
        #[arg(long)]
        force: bool,

        /// Minify output.
        #[arg(long)]
        minify: bool,

        /// Maximum source/artifact mtime drift in milliseconds.
        #[arg(long, default_value = "250")]
        hash_drift: u64,

        /// Log level.
        #[arg(long, default_value = "warn", env = "JITBUILD_LOG_LEVEL")]
        log_level: String,

        /// Log format (json or pretty).
        #[arg(long, default_value = "pretty")]
        log_format: String,

        /// YAML file overriding the engine commands.
        #[arg(long)]
        engine_config: Option<PathBuf>,
    },
}

struct ServeArgs {
    listen: String,
    mount: String,
    root: PathBuf,
    cache_dir: PathBuf,
    freshness: Freshness,
    minify: bool,
    serve_non_handled: bool,
    engine_config: Option<PathBuf>,
}

/// Shared server state.
struct Server {
    middleware: AssetMiddleware,
    telemetry: Telemetry,
}

impl Server {
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let started = Instant::now();
        let response = match req.uri().path() {
            HEALTH_PATH => self.health_response(),
            METRICS_PATH => self.metrics_response(),
            _ => match self.middleware.handle(&req).await {
                Some(response) => response,
                None => status_response(StatusCode::NOT_FOUND, "Not Found"),
            },
        };

        self.telemetry.metrics().record_request(
            req.method().as_str(),
            response.status().as_u16(),
            started.elapsed().as_secs_f64(),
        );
        Ok(response)
    }

    fn health_response(&self) -> Response<Full<Bytes>> {
        let body = serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "builds_in_flight": self.middleware.protocol().inflight().len(),
        });
        json_response(body.to_string())
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        let mut response = status_response(StatusCode::OK, self.telemetry.render_prometheus());
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
        );
        response
    }
}

fn json_response(body: String) -> Response<Full<Bytes>> {
    let mut response = status_response(StatusCode::OK, body);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn init_telemetry(log_level: &str, log_format: &str) -> Result<Telemetry, String> {
    let format = LogFormat::parse(log_format)
        .ok_or_else(|| format!("invalid log format: {} (expected json or pretty)", log_format))?;
    let config = TelemetryConfig::new()
        .with_log_level(log_level)
        .with_log_format(format);
    Telemetry::init(config).map_err(|e| e.to_string())
}

fn load_engine(engine_config: Option<&Path>) -> Result<CommandEngine, String> {
    let table = match engine_config {
        Some(path) => CommandTable::load(path).map_err(|e| e.to_string())?,
        None => CommandTable::default(),
    };
    Ok(CommandEngine::new(table))
}

fn absolute_dir(path: &Path) -> Result<PathBuf, String> {
    std::fs::canonicalize(path).map_err(|e| format!("invalid directory {}: {}", path.display(), e))
}

/// Run the serve command.
async fn run_serve(args: ServeArgs, telemetry: Telemetry) -> ExitCode {
    let root = match absolute_dir(&args.root) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };
    let cache_dir = if args.cache_dir.is_absolute() {
        args.cache_dir.clone()
    } else {
        root.join(&args.cache_dir)
    };

    let engine = match load_engine(args.engine_config.as_deref()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let compiler = Compiler::new(
        Arc::new(engine),
        CompilerConfig {
            observers: Observers::new().with(Arc::new(LogObserver::new().with_root(&root))),
            ..CompilerConfig::default()
        },
    );

    let source_root = root.clone();
    let protocol = ProtocolConfig::new(
        move |req: &AssetRequest| Ok(source_root.join(req.relative_path())),
        move |req: &AssetRequest| Ok(cache_dir.join(req.relative_path())),
    )
    .with_root(RootPolicy::confined(&root))
    .serve_non_handled(args.serve_non_handled)
    .with_freshness(args.freshness)
    .with_build(BuildOptions::default().with_minify(args.minify))
    .with_adapter(AdapterOptions::new().with_root_dir(&root))
    .with_observer(Arc::new(TracingReporter))
    .with_observer(Arc::new(MetricsObserver::new(telemetry.metrics_clone())));

    let middleware = AssetMiddleware::new(
        compiler,
        MiddlewareConfig::from_protocol(protocol).with_mount(&args.mount),
    );
    let server = Arc::new(Server {
        middleware,
        telemetry,
    });

    let addr: SocketAddr = match args.listen.parse() {
        Ok(a) => a,
        Err(_) => {
            eprintln!("error: invalid listen address: {}", args.listen);
            return ExitCode::from(1);
        }
    };

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: failed to bind to {}: {}", addr, e);
            return ExitCode::from(1);
        }
    };

    let local_addr = listener.local_addr().unwrap_or(addr);
    log_listening!(
        address = %local_addr,
        mount = %args.mount,
        root = %root.display(),
        "jitbuild listening"
    );
    eprintln!("jitbuild: listening on {}", local_addr);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log_shutdown!("shutting down");
                return ExitCode::SUCCESS;
            }
        };

        let server = Arc::clone(&server);
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let server = Arc::clone(&server);
                async move { server.handle_request(req).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "connection error");
            }
        });
    }
}

/// Run the build command.
async fn run_build(
    patterns: &[String],
    freshness: Freshness,
    minify: bool,
    engine_config: Option<&Path>,
) -> ExitCode {
    let engine = match load_engine(engine_config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let compiler = Compiler::new(
        Arc::new(engine),
        CompilerConfig {
            observers: Observers::new().with(Arc::new(LogObserver::new().with_root(&root))),
            ..CompilerConfig::default()
        },
    );
    let config = BatchConfig::new().with_protocol(|p| {
        p.with_freshness(freshness)
            .with_build(BuildOptions::default().with_minify(minify))
            .with_observer(Arc::new(TracingReporter))
    });

    let report = match BatchCompiler::new(compiler, config).run(patterns).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    for (path, err) in &report.failed {
        eprintln!("error: {}: {}", path.display(), err);
    }
    eprintln!(
        "jitbuild: {} built, {} fresh, {} skipped, {} failed",
        report.built.len(),
        report.fresh.len(),
        report.skipped.len(),
        report.failed.len()
    );

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn freshness(immutable: bool, force: bool, hash_drift_ms: u64) -> Freshness {
    Freshness::default()
        .with_hash_drift(Duration::from_millis(hash_drift_ms))
        .immutable(immutable)
        .force(force)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            mount,
            root,
            cache_dir,
            immutable,
            force,
            hash_drift,
            minify,
            serve_non_handled,
            log_level,
            log_format,
            engine_config,
        } => {
            let telemetry = match init_telemetry(&log_level, &log_format) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(1);
                }
            };
            log_startup!(version = env!("CARGO_PKG_VERSION"), "jitbuild starting");

            let args = ServeArgs {
                listen,
                mount,
                root,
                cache_dir,
                freshness: freshness(immutable, force, hash_drift),
                minify,
                serve_non_handled,
                engine_config,
            };
            run_serve(args, telemetry).await
        }
        Commands::Build {
            patterns,
            force,
            minify,
            hash_drift,
            log_level,
            log_format,
            engine_config,
        } => {
            if let Err(e) = init_telemetry(&log_level, &log_format) {
                eprintln!("error: {}", e);
                return ExitCode::from(1);
            }
            run_build(
                &patterns,
                freshness(false, force, hash_drift),
                minify,
                engine_config.as_deref(),
            )
            .await
        }
    }
}
