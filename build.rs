// Embeds the git commit into the binary so `--version` can report the
// exact build even when installed outside a checkout.

use std::{fs, process::Command};

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    let commit = commit_from_git()
        .or_else(commit_from_head_file)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=PARGET_COMMIT={}", commit);
}

fn commit_from_git() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn commit_from_head_file() -> Option<String> {
    let head = fs::read_to_string(".git/HEAD").ok()?;
    if let Some(ref_path) = head.strip_prefix("ref: ") {
        let commit = fs::read_to_string(format!(".git/{}", ref_path.trim())).ok()?;
        Some(commit.trim().chars().take(12).collect())
    } else {
        Some(head.trim().chars().take(12).collect())
    }
}
