//! Embeds a human-readable version string as `BUILD_INFO_HUMAN`.
//!
//! Format: `{pkg version} ({git version}) {rustc version}`. The git part
//! is `git describe --tags --dirty` when a tag exists, otherwise
//! `{short sha}[+dirty] {commit date}`, and is left out entirely outside a
//! git checkout.

use std::process::Command;

use chrono::{DateTime, Utc};

fn main() {
    for path in ["src", "build.rs", "Cargo.toml", "Cargo.lock"] {
        println!("cargo:rerun-if-changed={path}");
    }

    let build_info = [
        Some(env!("CARGO_PKG_VERSION").to_string()),
        git_version().map(|v| format!("({v})")),
        output_of("rustc", &["--version"]),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");

    println!("cargo:rustc-env=BUILD_INFO_HUMAN={build_info}");
}

fn output_of(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn git_version() -> Option<String> {
    if let Some(described) = output_of("git", &["describe", "--tags", "--dirty"]) {
        return Some(described);
    }

    let sha = output_of("git", &["rev-parse", "--short=12", "HEAD"])?;
    // `.cargo-ok` is written by `cargo install --git` and is not a change.
    let dirty = output_of("git", &["status", "--porcelain"]).is_some_and(|status| {
        status
            .lines()
            .any(|line| line.get(3..).is_some_and(|path| path != ".cargo-ok"))
    });
    let date = output_of("git", &["log", "-1", "--format=%ct"])
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    let suffix = if dirty { "+dirty" } else { "" };
    Some(format!("{sha}{suffix} {date}").trim().to_string())
}
