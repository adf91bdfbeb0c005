//! End-to-end scenarios against the fixture sources.

use std::sync::Arc;
use std::time::Duration;

use filetime::FileTime;
use futures_util::future::join_all;
use jitbuild_compiler::{
    AdapterOptions, BuildOptions, Compiler, CompilerConfig, RewriteExport, StdinInput,
};
use jitbuild_lib::{BatchCompiler, BatchConfig, Freshness};
use reqwest::StatusCode;

use crate::{copy_fixtures, fixtures, StubEngine, TestServer};

fn mtime(path: &std::path::Path) -> FileTime {
    FileTime::from_last_modification_time(&std::fs::metadata(path).unwrap())
}

fn swap_files(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".swp"))
                .collect()
        })
        .unwrap_or_default()
}

/// Poll `done` until it holds. Responses are sent before the artifact is
/// published, so disk state lags the response slightly.
async fn eventually(done: impl Fn() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn vue_component_builds_once_then_serves_from_cache() {
    let server = TestServer::start().await.unwrap();
    assert!(!server.artifact("widgets.vue").exists());

    let resp = server.get("widgets.vue").await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/javascript");
    let first = resp.text().await.unwrap();
    assert!(first.contains("export default __vue_component__;"));

    let artifact = server.artifact("widgets.vue");
    eventually(|| artifact.exists()).await;
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), first);
    assert_eq!(mtime(&artifact), mtime(&server.source("widgets.vue")));

    let second = server.get("widgets.vue").await.unwrap().text().await.unwrap();
    assert_eq!(second, first);
    assert_eq!(server.builds(), 1);
}

#[tokio::test]
async fn scss_is_flattened_and_served_as_css() {
    let server = TestServer::start().await.unwrap();

    let resp = server.get("doodahs.scss").await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/css");
    let css = resp.text().await.unwrap();
    assert_eq!(css.matches(".doodahs .thing {").count(), 1);
}

#[tokio::test]
async fn content_length_matches_body() {
    let server = TestServer::start().await.unwrap();
    let resp = server.get("main.js").await.unwrap();
    let length: usize = resp.headers()["content-length"].to_str().unwrap().parse().unwrap();
    assert_eq!(resp.bytes().await.unwrap().len(), length);
}

#[tokio::test]
async fn png_is_served_raw_without_artifact() {
    let server = TestServer::start().await.unwrap();

    let resp = server.get("logo.png").await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/png");
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.to_vec(), std::fs::read(fixtures().join("data/logo.png")).unwrap());

    assert!(!server.artifact("logo.png").exists());
    assert_eq!(server.builds(), 0);
}

#[tokio::test]
async fn png_is_forbidden_without_raw_serving() {
    let server = TestServer::start_with(StubEngine::new(), |c| {
        c.with_protocol(|p| p.serve_non_handled(false))
    })
    .await
    .unwrap();

    let resp = server.get("logo.png").await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn missing_source_is_404() {
    let server = TestServer::start().await.unwrap();
    let resp = server.get("nowhere.vue").await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(server.builds(), 0);
}

#[tokio::test]
async fn outside_mount_is_404() {
    let server = TestServer::start().await.unwrap();
    let resp = server
        .request(reqwest::Method::GET, "/widgets.vue")
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn encoded_traversal_never_resolves() {
    let server = TestServer::start().await.unwrap();
    let resp = server
        .request(reqwest::Method::GET, "/assets/%2e%2e/%2e%2e/etc/passwd")
        .await
        .unwrap();
    assert_ne!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn build_error_is_400_and_leaves_no_swap() {
    let server = TestServer::start().await.unwrap();

    let resp = server.get("broken.scss").await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(resp.text().await.unwrap().contains("Undefined variable: $missing"));

    assert!(!server.artifact("broken.scss").exists());
    assert!(swap_files(&server.cache_dir()).is_empty());
}

#[tokio::test]
async fn edited_source_is_rebuilt() {
    let server = TestServer::start().await.unwrap();
    server.get("main.js").await.unwrap();
    let artifact = server.artifact("main.js");
    eventually(|| artifact.exists()).await;

    let source = server.source("main.js");
    std::fs::write(&source, "export default 'edited';\n").unwrap();
    let later = FileTime::from_unix_time(mtime(&source).unix_seconds() + 10, 0);
    filetime::set_file_mtime(&source, later).unwrap();

    let body = server.get("main.js").await.unwrap().text().await.unwrap();
    assert_eq!(body, "export default 'edited';\n");
    assert_eq!(server.builds(), 2);
    eventually(|| mtime(&artifact) == later).await;
}

#[tokio::test]
async fn immutable_serves_stale_artifact() {
    let server = TestServer::start_with(StubEngine::new(), |c| {
        c.with_protocol(|p| p.with_freshness(Freshness::default().immutable(true)))
    })
    .await
    .unwrap();

    let artifact = server.artifact("main.js");
    std::fs::create_dir_all(server.cache_dir()).unwrap();
    std::fs::write(&artifact, "/* pinned */").unwrap();
    filetime::set_file_mtime(&artifact, FileTime::from_unix_time(0, 0)).unwrap();

    let body = server.get("main.js").await.unwrap().text().await.unwrap();
    assert_eq!(body, "/* pinned */");
    assert_eq!(server.builds(), 0);
}

#[tokio::test]
async fn concurrent_misses_share_one_build() {
    let server = TestServer::start_with(
        StubEngine::new().with_delay(Duration::from_millis(100)),
        |c| c,
    )
    .await
    .unwrap();

    let requests = (0..6).map(|_| async {
        let resp = server.get("widgets.vue").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        resp.text().await.unwrap()
    });
    let bodies = join_all(requests).await;

    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(server.builds(), 1);
    let artifact = server.artifact("widgets.vue");
    eventually(|| artifact.exists()).await;
    assert_eq!(
        std::fs::read_to_string(&artifact).unwrap(),
        bodies[0]
    );
    assert!(swap_files(&server.cache_dir()).is_empty());
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_builds_fixture_tree() {
    let dir = tempfile::tempdir().unwrap();
    copy_fixtures(dir.path()).unwrap();
    let engine = Arc::new(StubEngine::new());
    let compiler = Compiler::new(engine.clone(), CompilerConfig::default());
    let batch = BatchCompiler::new(compiler, BatchConfig::new());
    let pattern = format!("{}/*", dir.path().display());

    let report = batch.run(&[pattern.as_str()]).await.unwrap();
    assert_eq!(report.built.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, dir.path().join("broken.scss"));
    assert_eq!(report.skipped, vec![dir.path().join("logo.png")]);

    let css = std::fs::read_to_string(dir.path().join("doodahs.compiled.css")).unwrap();
    assert_eq!(css.matches(".doodahs .thing {").count(), 1);
    assert!(dir.path().join("widgets.compiled.js").exists());
    assert!(dir.path().join("main.compiled.js").exists());
    assert_eq!(
        mtime(&dir.path().join("widgets.compiled.js")),
        mtime(&dir.path().join("widgets.vue"))
    );

    let report = batch
        .run(&[format!("{}/*.vue", dir.path().display())])
        .await
        .unwrap();
    assert_eq!(report.fresh.len(), 1);
    assert_eq!(engine.builds(), 4);
}

// ---------------------------------------------------------------------------
// Compiler adapter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn export_rewrite_touches_one_statement() {
    let compiler = Compiler::new(Arc::new(StubEngine::new()), CompilerConfig::default());
    let source = fixtures().join("data/widgets.vue");
    let adapter = AdapterOptions::new()
        .with_rewrite_export(RewriteExport::Template("window.Widgets = ${exported};".into()));

    let result = compiler
        .compile(BuildOptions::entry(&source), adapter)
        .await
        .unwrap();
    let text = &result.primary().unwrap().text;
    assert!(text.contains("window.Widgets = __vue_component__;"));
    assert!(!text.contains(";\nexport default"));
    assert!(text.contains("const __vue_component__ = __vue_script__;"));
}

#[tokio::test]
async fn inline_source_compiles_by_virtual_name() {
    let compiler = Compiler::new(Arc::new(StubEngine::new()), CompilerConfig::default());
    let build = BuildOptions::stdin(StdinInput {
        contents: ".inline {\n  .nested { margin: 0; }\n}\n".to_string(),
        sourcefile: "inline.scss".into(),
        resolve_dir: None,
    });

    let result = compiler.compile(build, AdapterOptions::new()).await.unwrap();
    assert_eq!(result.primary().unwrap().text, ".inline .nested {\n  margin: 0;\n}\n");
    assert_eq!(result.dest, std::path::PathBuf::from("inline.scss"));
}

#[tokio::test]
async fn published_artifact_carries_source_times() {
    let dir = tempfile::tempdir().unwrap();
    copy_fixtures(dir.path()).unwrap();
    let source = dir.path().join("doodahs.scss");
    let stamp = jitbuild_compiler::FileStamp::read(&source).await.unwrap();

    let compiler = Compiler::new(Arc::new(StubEngine::new()), CompilerConfig::default());
    let result = compiler
        .compile(
            BuildOptions::entry(&source),
            AdapterOptions::new().with_source_stats(stamp),
        )
        .await
        .unwrap();

    let dest = dir.path().join("out/doodahs.css");
    let options = jitbuild_compiler::PublishOptions::new().with_copy_stats(stamp);
    result.publish(&dest, &options).await.unwrap();
    assert_eq!(mtime(&dest), stamp.modified);
}
