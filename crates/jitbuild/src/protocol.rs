//! The freshness protocol.
//!
//! One run drives a [`Session`] through
//! `RESOLVING -> CACHE_HIT | CACHE_MISS -> COMPILING -> PUBLISHING -> SERVED`,
//! always finishing with cleanup of the swap file. Both the request middleware
//! and the batch compiler are thin drivers around [`Protocol::run`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use jitbuild_compiler::{
    AdapterOptions, BuildOptions, BuildResult, Compiler, FileStamp, PublishOptions,
};
use uuid::Uuid;

use crate::confine::RootPolicy;
use crate::error::ProtocolError;
use crate::freshness::Freshness;
use crate::inflight::InFlight;
use crate::observers::{SessionObserver, SessionObservers};
use crate::session::{Delivery, Outcome, Served, Session, SessionState};

/// Computes a path from the session input.
pub type Resolver<T> = Arc<dyn Fn(&T) -> Result<PathBuf, ProtocolError> + Send + Sync>;

/// Computes the swap path from the session input and resolved destination.
pub type SwapResolver<T> = Arc<dyn Fn(&T, &Path) -> Result<PathBuf, ProtocolError> + Send + Sync>;

/// Decides whether a resolved source is compiled at all.
pub type HandleFn = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// `<dest dir>/.<dest name>.<uuid>.swp`, on the destination's filesystem.
pub fn default_swap_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.{}.swp", Uuid::new_v4()))
}

/// Handle every source a registered format knows about.
pub fn default_handle(path: &Path) -> bool {
    jitbuild_formats::lookup(path).is_ok()
}

/// Protocol configuration, generic over the session input.
pub struct ProtocolConfig<T> {
    pub source: Resolver<T>,
    pub dest: Resolver<T>,
    pub swap: SwapResolver<T>,
    pub handle: HandleFn,
    pub root: RootPolicy,
    /// Serve sources the handle predicate rejects as-is.
    pub serve_non_handled: bool,
    pub freshness: Freshness,
    /// Engine overrides. Entry points are filled in per session.
    pub build: BuildOptions,
    pub adapter: AdapterOptions,
    pub observers: SessionObservers,
}

impl<T> Clone for ProtocolConfig<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            dest: Arc::clone(&self.dest),
            swap: Arc::clone(&self.swap),
            handle: Arc::clone(&self.handle),
            root: self.root.clone(),
            serve_non_handled: self.serve_non_handled,
            freshness: self.freshness.clone(),
            build: self.build.clone(),
            adapter: self.adapter.clone(),
            observers: self.observers.clone(),
        }
    }
}

impl<T> ProtocolConfig<T> {
    pub fn new<S, D>(source: S, dest: D) -> Self
    where
        S: Fn(&T) -> Result<PathBuf, ProtocolError> + Send + Sync + 'static,
        D: Fn(&T) -> Result<PathBuf, ProtocolError> + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
            dest: Arc::new(dest),
            swap: Arc::new(|_: &T, dest: &Path| Ok(default_swap_path(dest))),
            handle: Arc::new(default_handle),
            root: RootPolicy::Unrestricted,
            serve_non_handled: true,
            freshness: Freshness::default(),
            build: BuildOptions::default(),
            adapter: AdapterOptions::default(),
            observers: SessionObservers::new(),
        }
    }

    pub fn with_swap<F>(mut self, swap: F) -> Self
    where
        F: Fn(&T, &Path) -> Result<PathBuf, ProtocolError> + Send + Sync + 'static,
    {
        self.swap = Arc::new(swap);
        self
    }

    pub fn with_handle<F>(mut self, handle: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.handle = Arc::new(handle);
        self
    }

    pub fn with_root(mut self, root: RootPolicy) -> Self {
        self.root = root;
        self
    }

    pub fn serve_non_handled(mut self, enabled: bool) -> Self {
        self.serve_non_handled = enabled;
        self
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_build(mut self, build: BuildOptions) -> Self {
        self.build = build;
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterOptions) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

/// Runs build sessions against a compiler.
pub struct Protocol<T> {
    compiler: Compiler,
    config: ProtocolConfig<T>,
    inflight: InFlight,
}

impl<T> Protocol<T> {
    pub fn new(compiler: Compiler, config: ProtocolConfig<T>) -> Self {
        Self {
            compiler,
            config,
            inflight: InFlight::new(),
        }
    }

    pub fn config(&self) -> &ProtocolConfig<T> {
        &self.config
    }

    /// Compiles currently in flight.
    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    /// Run one session for `input`.
    ///
    /// Served bytes go to `delivery` as soon as they are known; the future
    /// resolves once publishing and cleanup are done. A missing source is
    /// returned as [`ProtocolError::SourceNotFound`] without being reported
    /// to `on_error`.
    pub async fn run(&self, input: &T, delivery: Delivery) -> Result<Session, ProtocolError> {
        let mut session = Session::default();
        let observers = &self.config.observers;
        observers.emit("started", |o| o.on_started(&session));

        let result = self.drive(input, &mut session, delivery).await;
        cleanup(&session).await;

        let result = match result {
            Ok(outcome) => {
                if outcome != Outcome::Forbidden {
                    session.state = SessionState::Served;
                }
                session.outcome = Some(outcome);
                Ok(())
            }
            Err(err) => {
                session.state = SessionState::Errored;
                if !err.is_not_found() {
                    observers.emit("error", |o| o.on_error(&err, &session));
                }
                Err(err)
            }
        };
        observers.emit("finished", |o| o.on_finished(&session));
        result.map(|()| session)
    }

    async fn drive(
        &self,
        input: &T,
        session: &mut Session,
        delivery: Delivery,
    ) -> Result<Outcome, ProtocolError> {
        let config = &self.config;
        session.state = SessionState::Resolving;

        let requested = (config.source)(input)?;
        let source = config.root.confine(&requested)?;
        session.source_path = source.clone();

        let source_stats = stat_source(&source).await?;
        session.source_stats = Some(source_stats);

        if !(config.handle)(&source) {
            return self.passthrough(session, delivery).await;
        }

        let format = jitbuild_formats::lookup(&source)?;
        session.source_format = Some(format);

        let dest = (config.dest)(input)?;
        let swap = (config.swap)(input, &dest)?;
        session.dest_path = Some(dest.clone());
        session.swap_path = Some(swap.clone());

        let (dest_stats, dest_dir, swap_dir) = tokio::join!(
            stat_optional(&dest),
            ensure_parent(&dest),
            ensure_parent(&swap),
        );
        session.dest_stats = dest_stats?;
        dest_dir?;
        swap_dir?;

        let fresh = config
            .freshness
            .is_fresh(&source_stats, session.dest_stats.as_ref());
        session.fresh = Some(fresh);

        if fresh {
            session.state = SessionState::CacheHit;
            config.observers.emit("cache_hit", |o| o.on_cache_hit(session));
            if delivery.wants_body() {
                let body = tokio::fs::read(&dest)
                    .await
                    .map_err(|e| ProtocolError::io(&dest, e))?;
                delivery.deliver(Served {
                    body: Bytes::from(body),
                    content_type: Some(format.content_type),
                });
            }
            return Ok(Outcome::CacheHit);
        }

        session.state = SessionState::CacheMiss;
        config.observers.emit("cache_miss", |o| o.on_cache_miss(session));

        session.state = SessionState::Compiling;
        let (build, leader) = self.inflight.join_or_start(dest.clone(), || {
            let compiler = self.compiler.clone();
            let build = BuildOptions {
                entry_points: vec![source.clone()],
                stdin: None,
                ..config.build.clone()
            };
            let adapter = config.adapter.clone().with_source_stats(source_stats);
            async move {
                compiler
                    .compile(build, adapter)
                    .await
                    .map(Arc::new)
                    .map_err(Arc::new)
            }
            .boxed()
        });
        let result = build.await.map_err(ProtocolError::BuildFailure)?;
        session.build_result = Some(Arc::clone(&result));

        delivery.deliver(Served {
            body: primary_body(&result),
            content_type: Some(format.content_type),
        });

        if !leader {
            config.observers.emit("joined", |o| o.on_joined(session));
            return Ok(Outcome::Joined);
        }

        session.state = SessionState::Publishing;
        let options = PublishOptions::new()
            .with_swap_path(&swap)
            .with_copy_stats(source_stats)
            .with_output_index(0);
        result
            .publish(&dest, &options)
            .await
            .map_err(ProtocolError::from_publish)?;
        session.swap_consumed = true;

        config.observers.emit("built", |o| o.on_built(session, &result));
        Ok(Outcome::Built)
    }

    async fn passthrough(
        &self,
        session: &mut Session,
        delivery: Delivery,
    ) -> Result<Outcome, ProtocolError> {
        if !self.config.serve_non_handled {
            session.state = SessionState::Forbidden;
            return Ok(Outcome::Forbidden);
        }

        let source = session.source_path.clone();
        if delivery.wants_body() {
            let body = tokio::fs::read(&source)
                .await
                .map_err(|e| ProtocolError::io(&source, e))?;
            delivery.deliver(Served {
                body: Bytes::from(body),
                content_type: jitbuild_formats::passthrough_content_type(&source),
            });
        }
        self.config
            .observers
            .emit("passthrough", |o| o.on_passthrough(session));
        Ok(Outcome::Passthrough)
    }
}

fn primary_body(result: &BuildResult) -> Bytes {
    result
        .primary()
        .map(|file| Bytes::from(file.text.clone()))
        .unwrap_or_default()
}

async fn stat_source(path: &Path) -> Result<FileStamp, ProtocolError> {
    match FileStamp::read(path).await {
        Ok(stamp) => Ok(stamp),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ProtocolError::SourceNotFound(path.to_path_buf()))
        }
        Err(e) => Err(ProtocolError::io(path, e)),
    }
}

async fn stat_optional(path: &Path) -> Result<Option<FileStamp>, ProtocolError> {
    match FileStamp::read(path).await {
        Ok(stamp) => Ok(Some(stamp)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProtocolError::io(path, e)),
    }
}

async fn ensure_parent(path: &Path) -> Result<(), ProtocolError> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ProtocolError::io(dir, e)),
        None => Ok(()),
    }
}

/// Remove a leftover swap file. Failures are ignored.
async fn cleanup(session: &Session) {
    if session.swap_consumed {
        return;
    }
    let Some(swap) = &session.swap_path else {
        return;
    };
    if tokio::fs::try_exists(swap).await.unwrap_or(false) {
        if let Err(e) = tokio::fs::remove_file(swap).await {
            tracing::debug!(swap = %swap.display(), error = %e, "failed to remove swap file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freshness::DEFAULT_HASH_DRIFT;
    use filetime::FileTime;
    use futures_util::future::BoxFuture;
    use jitbuild_compiler::{
        CompilerConfig, Engine, EngineError, EngineOptions, EngineOutput, Message, OutputFile,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes the entry's contents, optionally after a delay.
    #[derive(Default)]
    struct EchoEngine {
        builds: AtomicUsize,
        delay: Option<Duration>,
        fail: bool,
    }

    impl Engine for EchoEngine {
        fn build<'a>(
            &'a self,
            options: &'a EngineOptions,
        ) -> BoxFuture<'a, Result<EngineOutput, EngineError>> {
            Box::pin(async move {
                self.builds.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail {
                    return Ok(EngineOutput {
                        errors: vec![Message::new("Unexpected end of file")],
                        ..EngineOutput::default()
                    });
                }
                let entry = &options.entry_points[0];
                let text = tokio::fs::read_to_string(entry).await?;
                Ok(EngineOutput {
                    output_files: vec![OutputFile {
                        path: entry.clone(),
                        text: format!("/* compiled */\n{text}"),
                    }],
                    ..EngineOutput::default()
                })
            })
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        engine: Arc<EchoEngine>,
    }

    impl Fixture {
        fn new(engine: EchoEngine) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("src")).unwrap();
            Self {
                dir,
                engine: Arc::new(engine),
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.root().join("src").join(name);
            std::fs::write(&path, contents).unwrap();
            path
        }

        fn dest(&self, name: &str) -> PathBuf {
            self.root().join("cache").join(name)
        }

        fn swap(&self, name: &str) -> PathBuf {
            self.root().join("swap").join(format!("{name}.swp"))
        }

        /// Input is a path relative to `<root>/src`.
        fn config(&self) -> ProtocolConfig<String> {
            let root = self.root().to_path_buf();
            let cache = self.root().join("cache");
            let swap = self.root().join("swap");
            ProtocolConfig::new(
                |name: &String| Ok(PathBuf::from("src").join(name)),
                move |name: &String| Ok(cache.join(name)),
            )
            .with_swap(move |name: &String, _dest: &Path| Ok(swap.join(format!("{name}.swp"))))
            .with_root(RootPolicy::confined(root))
        }

        fn protocol(&self, config: ProtocolConfig<String>) -> Protocol<String> {
            let compiler = Compiler::new(self.engine.clone(), CompilerConfig::default());
            Protocol::new(compiler, config)
        }

        fn builds(&self) -> usize {
            self.engine.builds.load(Ordering::SeqCst)
        }
    }

    fn mtime(path: &Path) -> FileTime {
        FileTime::from_last_modification_time(&std::fs::metadata(path).unwrap())
    }

    fn set_mtime(path: &Path, time: FileTime) {
        filetime::set_file_mtime(path, time).unwrap();
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl SessionObserver for Recorder {
        fn on_cache_hit(&self, _s: &Session) {
            self.0.lock().push("hit".into());
        }
        fn on_cache_miss(&self, _s: &Session) {
            self.0.lock().push("miss".into());
        }
        fn on_built(&self, _s: &Session, _r: &BuildResult) {
            self.0.lock().push("built".into());
        }
        fn on_error(&self, error: &ProtocolError, _s: &Session) {
            self.0.lock().push(format!("error:{}", error.kind()));
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let fx = Fixture::new(EchoEngine::default());
        let source = fx.write("widgets.vue", "export default {};\n");
        let protocol = fx.protocol(fx.config());

        let (delivery, rx) = Delivery::channel();
        let session = protocol.run(&"widgets.vue".to_string(), delivery).await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::Built));
        assert_eq!(session.state, SessionState::Served);
        assert_eq!(session.fresh, Some(false));
        assert!(session.build_result.is_some());

        let served = rx.await.unwrap();
        assert_eq!(served.content_type, Some("text/javascript"));
        let dest = fx.dest("widgets.vue");
        assert_eq!(std::fs::read(&dest).unwrap(), served.body.to_vec());
        assert_eq!(mtime(&dest), mtime(&source));

        let session = protocol
            .run(&"widgets.vue".to_string(), Delivery::Discard)
            .await
            .unwrap();
        assert_eq!(session.outcome, Some(Outcome::CacheHit));
        assert_eq!(session.fresh, Some(true));
        assert!(session.build_result.is_none());
        assert_eq!(fx.builds(), 1);
    }

    #[tokio::test]
    async fn cache_hits_are_idempotent() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("a.js", "export default 1;\n");
        let protocol = fx.protocol(fx.config());
        protocol.run(&"a.js".to_string(), Delivery::Discard).await.unwrap();

        let dest = fx.dest("a.js");
        let before = std::fs::read(&dest).unwrap();
        let stamp = mtime(&dest);

        for _ in 0..5 {
            let (delivery, rx) = Delivery::channel();
            let session = protocol.run(&"a.js".to_string(), delivery).await.unwrap();
            assert_eq!(session.outcome, Some(Outcome::CacheHit));
            assert_eq!(rx.await.unwrap().body.to_vec(), before);
        }
        assert_eq!(mtime(&dest), stamp);
        assert_eq!(fx.builds(), 1);
    }

    #[tokio::test]
    async fn drift_past_tolerance_rebuilds() {
        let fx = Fixture::new(EchoEngine::default());
        let source = fx.write("a.js", "one");
        let protocol = fx.protocol(fx.config());
        protocol.run(&"a.js".to_string(), Delivery::Discard).await.unwrap();

        let base = mtime(&source).unix_seconds();
        let dest = fx.dest("a.js");
        let at = |ms: i64| {
            FileTime::from_unix_time(base + ms / 1000, ((ms % 1000) * 1_000_000) as u32)
        };
        let tolerance = DEFAULT_HASH_DRIFT.as_millis() as i64;

        set_mtime(&source, at(0));
        set_mtime(&dest, at(tolerance));
        let session = protocol.run(&"a.js".to_string(), Delivery::Discard).await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::CacheHit));

        set_mtime(&dest, at(tolerance + 1));
        let session = protocol.run(&"a.js".to_string(), Delivery::Discard).await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::Built));
        assert_eq!(fx.builds(), 2);
        assert_eq!(mtime(&dest), mtime(&source));
    }

    #[tokio::test]
    async fn immutable_keeps_stale_artifact() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("a.js", "one");
        let dest = fx.dest("a.js");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, "pinned").unwrap();
        set_mtime(&dest, FileTime::from_unix_time(0, 0));

        let config = fx.config().with_freshness(Freshness::default().immutable(true));
        let session = fx.protocol(config).run(&"a.js".to_string(), Delivery::Discard).await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::CacheHit));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "pinned");
        assert_eq!(fx.builds(), 0);
    }

    #[tokio::test]
    async fn force_always_rebuilds() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("a.js", "one");
        let protocol = fx.protocol(fx.config().with_freshness(Freshness::default().force(true)));

        for _ in 0..3 {
            let session = protocol.run(&"a.js".to_string(), Delivery::Discard).await.unwrap();
            assert_eq!(session.outcome, Some(Outcome::Built));
        }
        assert_eq!(fx.builds(), 3);
    }

    #[tokio::test]
    async fn missing_source_is_not_found_and_not_reported() {
        let fx = Fixture::new(EchoEngine::default());
        let recorder = Arc::new(Recorder::default());
        let protocol = fx.protocol(fx.config().with_observer(recorder.clone()));

        let err = protocol
            .run(&"missing.vue".to_string(), Delivery::Discard)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(recorder.0.lock().is_empty());
        assert!(!fx.swap("missing.vue").exists());
    }

    #[tokio::test]
    async fn escape_is_rejected_before_any_io() {
        let fx = Fixture::new(EchoEngine::default());
        let recorder = Arc::new(Recorder::default());
        let protocol = fx.protocol(fx.config().with_observer(recorder.clone()));

        let err = protocol
            .run(&"../../../../etc/passwd".to_string(), Delivery::Discard)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PathEscape { .. }));
        assert_eq!(*recorder.0.lock(), vec!["error:path_escape"]);
        assert!(!fx.root().join("cache").exists());
    }

    #[tokio::test]
    async fn unhandled_source_is_served_raw() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("logo.png", "\u{89}PNG");
        let protocol = fx.protocol(fx.config());

        let (delivery, rx) = Delivery::channel();
        let session = protocol.run(&"logo.png".to_string(), delivery).await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::Passthrough));
        assert!(session.fresh.is_none());

        let served = rx.await.unwrap();
        assert_eq!(served.body.to_vec(), "\u{89}PNG".as_bytes());
        assert_eq!(served.content_type, Some("image/png"));
        assert!(!fx.root().join("cache").exists());
        assert_eq!(fx.builds(), 0);
    }

    #[tokio::test]
    async fn unhandled_source_is_forbidden_without_fallback() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("logo.png", "png");
        let protocol = fx.protocol(fx.config().serve_non_handled(false));

        let (delivery, rx) = Delivery::channel();
        let session = protocol.run(&"logo.png".to_string(), delivery).await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::Forbidden));
        assert_eq!(session.state, SessionState::Forbidden);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn handled_but_unknown_format_fails() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("notes.txt", "hello");
        let protocol = fx.protocol(fx.config().with_handle(|_| true));

        let err = protocol
            .run(&"notes.txt".to_string(), Delivery::Discard)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn declined_vue_is_served_raw_without_js_type() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("widgets.vue", "<template></template>");
        let protocol = fx.protocol(fx.config().with_handle(|_| false));

        let (delivery, rx) = Delivery::channel();
        let session = protocol.run(&"widgets.vue".to_string(), delivery).await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::Passthrough));

        let served = rx.await.unwrap();
        assert_eq!(served.body.to_vec(), b"<template></template>");
        assert_eq!(served.content_type, None);
    }

    #[tokio::test]
    async fn missing_unhandled_source_is_not_found_without_fallback() {
        let fx = Fixture::new(EchoEngine::default());
        let protocol = fx.protocol(fx.config().serve_non_handled(false));

        let err = protocol
            .run(&"does-not-exist.png".to_string(), Delivery::Discard)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn missing_source_beats_unknown_format() {
        let fx = Fixture::new(EchoEngine::default());
        let protocol = fx.protocol(fx.config().with_handle(|_| true));

        let err = protocol
            .run(&"missing.txt".to_string(), Delivery::Discard)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SourceNotFound(_)));
        assert_eq!(fx.builds(), 0);
    }

    #[tokio::test]
    async fn build_failure_leaves_no_swap_and_keeps_artifact() {
        let fx = Fixture::new(EchoEngine {
            fail: true,
            ..EchoEngine::default()
        });
        fx.write("a.js", "broken(");
        let dest = fx.dest("a.js");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, "previous").unwrap();
        set_mtime(&dest, FileTime::from_unix_time(0, 0));

        let recorder = Arc::new(Recorder::default());
        let protocol = fx.protocol(fx.config().with_observer(recorder.clone()));
        let err = protocol.run(&"a.js".to_string(), Delivery::Discard).await.unwrap_err();

        assert_eq!(err.kind(), "build_failure");
        assert!(err.to_string().contains("Unexpected end of file"));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "previous");
        assert!(!fx.swap("a.js").exists());
        assert_eq!(*recorder.0.lock(), vec!["miss", "error:build_failure"]);
    }

    #[tokio::test]
    async fn publish_failure_cleans_up_swap() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("a.js", "ok");
        // The destination is a directory, so the final rename fails after
        // the swap file has been written.
        std::fs::create_dir_all(fx.dest("a.js").join("occupied")).unwrap();

        let protocol = fx.protocol(fx.config().with_freshness(Freshness::default().force(true)));
        let err = protocol.run(&"a.js".to_string(), Delivery::Discard).await.unwrap_err();

        assert_eq!(err.kind(), "write_failure");
        assert!(!fx.swap("a.js").exists());
    }

    #[tokio::test]
    async fn swap_is_gone_after_success() {
        let fx = Fixture::new(EchoEngine::default());
        fx.write("a.scss", ".a{}");
        let protocol = fx.protocol(fx.config());
        let session = protocol.run(&"a.scss".to_string(), Delivery::Discard).await.unwrap();

        assert!(session.swap_consumed);
        assert!(!fx.swap("a.scss").exists());
        assert_eq!(
            std::fs::read_dir(fx.root().join("swap")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn concurrent_misses_compile_once() {
        let fx = Fixture::new(EchoEngine {
            delay: Some(Duration::from_millis(50)),
            ..EchoEngine::default()
        });
        fx.write("widgets.vue", "export default {};\n");
        let protocol = Arc::new(fx.protocol(fx.config()));

        let runs = (0..4).map(|_| {
            let protocol = Arc::clone(&protocol);
            async move {
                let (delivery, rx) = Delivery::channel();
                let session = protocol.run(&"widgets.vue".to_string(), delivery).await.unwrap();
                (session.outcome, rx.await.unwrap().body)
            }
        });
        let results = futures_util::future::join_all(runs).await;

        let built = results.iter().filter(|(o, _)| *o == Some(Outcome::Built)).count();
        let joined = results.iter().filter(|(o, _)| *o == Some(Outcome::Joined)).count();
        assert_eq!((built, joined), (1, 3));
        assert!(results.windows(2).all(|w| w[0].1 == w[1].1));
        assert_eq!(fx.builds(), 1);
        assert!(protocol.inflight().is_empty());

        let dest = std::fs::read(fx.dest("widgets.vue")).unwrap();
        assert_eq!(dest, results[0].1.to_vec());
    }

    #[tokio::test]
    async fn readers_never_see_partial_artifacts() {
        let fx = Fixture::new(EchoEngine {
            delay: Some(Duration::from_millis(5)),
            ..EchoEngine::default()
        });
        let large = "x".repeat(256 * 1024);
        fx.write("big.js", &large);
        let dest = fx.dest("big.js");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, "old artifact").unwrap();
        set_mtime(&dest, FileTime::from_unix_time(0, 0));

        let protocol = Arc::new(fx.protocol(fx.config().with_freshness(Freshness::default().force(true))));
        let expected = format!("/* compiled */\n{large}");

        let writer = {
            let protocol = Arc::clone(&protocol);
            tokio::spawn(async move {
                for _ in 0..5 {
                    protocol.run(&"big.js".to_string(), Delivery::Discard).await.unwrap();
                }
            })
        };

        while !writer.is_finished() {
            let seen = tokio::fs::read_to_string(&dest).await.unwrap();
            assert!(seen == "old artifact" || seen == expected, "partial read of {} bytes", seen.len());
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), expected);
    }

    #[test]
    fn default_swap_is_hidden_beside_dest() {
        let swap = default_swap_path(Path::new("/cache/components/widgets.js"));
        assert_eq!(swap.parent(), Some(Path::new("/cache/components")));
        let name = swap.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".widgets.js."));
        assert!(name.ends_with(".swp"));
        assert_ne!(swap, default_swap_path(Path::new("/cache/components/widgets.js")));
    }
}
