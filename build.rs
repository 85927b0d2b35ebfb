//! Embeds a human-readable build description for `ghbot --version`.
//!
//! The description is `<crate version> (<git version>) <rustc version>`,
//! where the git version is `git describe --tags --always --dirty` when a
//! tag is reachable, or `v<crate version>-<timestamp>-<commit>[+dirty]`
//! otherwise. Clean builds use the commit timestamp so the same commit
//! always yields the same string.

use std::{env, process::Command};

use chrono::{DateTime, Utc};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

fn main() {
    for path in ["src", "build.rs", "Cargo.toml", "Cargo.lock"] {
        println!("cargo:rerun-if-changed={path}");
    }

    println!("cargo:rustc-env=BUILD_INFO_HUMAN={}", build_info());
}

/// Runs a command and returns its trimmed, non-empty stdout.
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn git(args: &[&str]) -> Option<String> {
    command_output("git", args)
}

/// `None` outside a git checkout. `.cargo-ok` is written by
/// `cargo install --git` and does not count as a local change.
fn is_dirty() -> Option<bool> {
    git(&["status", "--porcelain"]).map(|status| {
        status
            .lines()
            .filter_map(|line| line.get(3..))
            .any(|path| path != ".cargo-ok")
    })
    .or_else(|| git(&["rev-parse", "--git-dir"]).map(|_| false))
}

fn pseudo_version() -> String {
    let commit = git(&["rev-parse", "--short=12", "HEAD"]).unwrap_or_else(|| "unknown".into());
    let dirty = is_dirty();

    let commit_time = match dirty {
        Some(false) => git(&["log", "-1", "--format=%ct"])
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    };
    let timestamp = commit_time
        .unwrap_or_else(Utc::now)
        .format(TIMESTAMP_FORMAT)
        .to_string();

    let suffix = if dirty == Some(true) { "+dirty" } else { "" };
    format!(
        "v{}-{timestamp}-{commit}{suffix}",
        env!("CARGO_PKG_VERSION")
    )
}

fn git_version() -> String {
    match git(&["describe", "--tags", "--always", "--dirty"]) {
        // A bare hash means no tag is reachable.
        Some(desc) if desc.contains('v') || desc.contains("-g") => desc,
        _ => pseudo_version(),
    }
}

fn build_info() -> String {
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());

    [
        Some(env!("CARGO_PKG_VERSION").to_string()),
        Some(format!("({})", git_version())),
        command_output(&rustc, &["--version"]),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ")
}
