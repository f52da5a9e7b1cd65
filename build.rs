use std::process::Command;

/// Exposes the commit the binary was built from as `GIT_HASH`.
/// `PIPELINE_GIT_HASH` wins when set, for builds outside a checkout.
fn git_hash() -> String {
    if let Ok(hash) = std::env::var("PIPELINE_GIT_HASH") {
        return hash;
    }
    Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=8"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=GIT_HASH={}", git_hash());
    println!("cargo:rerun-if-env-changed=PIPELINE_GIT_HASH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/");
}
