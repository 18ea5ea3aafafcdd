//! Stamps the binary with its build time and source revision.
//!
//! `BERTH_BUILD_TIMESTAMP` and `BERTH_GIT_COMMIT` feed `berth --version`.

use std::process::Command;

fn main() {
    for watched in [".git/HEAD", ".git/index", "build.rs"] {
        println!("cargo:rerun-if-changed={watched}");
    }

    let built_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let revision = short_head().unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=BERTH_BUILD_TIMESTAMP={built_at}");
    println!("cargo:rustc-env=BERTH_GIT_COMMIT={revision}");
}

/// Abbreviated HEAD of the source checkout, if built from one.
fn short_head() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;
    let head = String::from_utf8(output.stdout).ok()?;
    let head = head.trim();
    (!head.is_empty()).then(|| head.to_string())
}
