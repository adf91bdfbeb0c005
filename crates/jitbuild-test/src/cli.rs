//! CLI regression tests for the `jitbuild` binary.
//!
//! These tests invoke the binary as a subprocess to catch regressions in flag
//! names, exit codes and output formats.
//!
//! Run with: `cargo test -p jitbuild-test`
//! Requires the `jitbuild` binary to be built first (`cargo build -p jitbuild`).

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

use crate::{copy_fixtures, fixtures};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns an assert_cmd Command wrapping the `jitbuild` binary.
fn jitbuild() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("jitbuild").expect("jitbuild binary not found, run `cargo build -p jitbuild` first")
}

/// Temp directory holding a copy of the fixture sources.
fn fixture_tree() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    copy_fixtures(dir.path()).expect("copy fixtures");
    dir
}

// ---------------------------------------------------------------------------
// jitbuild --help
// ---------------------------------------------------------------------------

#[test]
fn help_lists_subcommands() {
    jitbuild()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("serve"))
        .stdout(contains("build"));
}

#[test]
fn serve_help_lists_flags() {
    jitbuild()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(contains("--mount"))
        .stdout(contains("--cache-dir"))
        .stdout(contains("--hash-drift"))
        .stdout(contains("--serve-non-handled"))
        .stdout(contains("--immutable"));
}

#[test]
fn unknown_subcommand_fails() {
    jitbuild().arg("compile").assert().failure().code(2);
}

// ---------------------------------------------------------------------------
// jitbuild build
// ---------------------------------------------------------------------------

#[test]
fn build_without_patterns_fails() {
    jitbuild().arg("build").assert().failure().code(2);
}

#[cfg(unix)]
#[test]
fn build_compiles_matches_beside_sources() {
    let dir = fixture_tree();
    jitbuild()
        .current_dir(dir.path())
        .args(["build", "*.vue", "*.js"])
        .arg("--engine-config")
        .arg(fixtures().join("engines/cat.yaml"))
        .assert()
        .success()
        .stderr(contains("2 built"));

    let compiled = std::fs::read_to_string(dir.path().join("widgets.compiled.js")).unwrap();
    let source = std::fs::read_to_string(dir.path().join("widgets.vue")).unwrap();
    assert_eq!(compiled, source);
    assert!(dir.path().join("main.compiled.js").exists());
}

#[cfg(unix)]
#[test]
fn second_build_reports_fresh() {
    let dir = fixture_tree();
    let run = || {
        jitbuild()
            .current_dir(dir.path())
            .args(["build", "*.scss"])
            .arg("--engine-config")
            .arg(fixtures().join("engines/cat.yaml"))
            .assert()
            .success()
    };
    run().stderr(contains("2 built"));
    run().stderr(contains("0 built, 2 fresh"));
}

#[cfg(unix)]
#[test]
fn build_skips_unhandled_files() {
    let dir = fixture_tree();
    jitbuild()
        .current_dir(dir.path())
        .args(["build", "*.png"])
        .arg("--engine-config")
        .arg(fixtures().join("engines/cat.yaml"))
        .assert()
        .success()
        .stderr(contains("1 skipped"));
    assert!(!dir.path().join("logo.compiled.png").exists());
}

#[test]
fn build_with_missing_engine_fails() {
    let dir = fixture_tree();
    let config = dir.path().join("engines.yaml");
    std::fs::write(&config, "vue:\n  program: jitbuild-no-such-compiler\n").unwrap();

    jitbuild()
        .current_dir(dir.path())
        .args(["build", "widgets.vue", "--engine-config"])
        .arg(&config)
        .assert()
        .failure()
        .code(1)
        .stderr(contains("widgets.vue"))
        .stderr(contains("1 failed"));
}

#[test]
fn build_with_invalid_engine_config_fails() {
    let dir = fixture_tree();
    jitbuild()
        .current_dir(dir.path())
        .args(["build", "*.vue", "--engine-config"])
        .arg(fixtures().join("engines/invalid.yaml"))
        .assert()
        .failure()
        .code(1)
        .stderr(contains("error:"));
}

#[test]
fn build_with_invalid_pattern_fails() {
    jitbuild()
        .args(["build", "src/***/["])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("invalid pattern"));
}

#[test]
fn build_with_invalid_log_format_fails() {
    jitbuild()
        .args(["build", "*.vue", "--log-format", "xml"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("invalid log format"));
}

// ---------------------------------------------------------------------------
// jitbuild serve
// ---------------------------------------------------------------------------

#[test]
fn serve_with_invalid_listen_address_fails() {
    let dir = fixture_tree();
    jitbuild()
        .args(["serve", "--listen", "not-an-address", "--root"])
        .arg(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(contains("invalid listen address"));
}

#[test]
fn serve_with_missing_root_fails() {
    jitbuild()
        .args(["serve", "--root", "/definitely/not/a/jitbuild/root"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("invalid directory"));
}
