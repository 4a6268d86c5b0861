//! Build script: embeds the git short hash into the version string.

use std::process::Command;

fn main() {
    if let Ok(output) = Command::new("git")
        .args(["rev-parse", "--short=7", "HEAD"])
        .output()
        && output.status.success()
    {
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        println!("cargo:rustc-env=GIT_HASH={}", hash);
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/");

    if std::env::var_os("CARGO_FEATURE_CUDA").is_some()
        && Command::new("nvcc").arg("--version").output().is_err()
    {
        panic!("`nvcc` not found: the CUDA toolkit is required for the `cuda` feature");
    }
    if std::env::var_os("CARGO_FEATURE_VULKAN").is_some()
        && Command::new("vulkaninfo")
            .arg("--summary")
            .output()
            .is_err()
    {
        panic!("`vulkaninfo` not found: the Vulkan SDK is required for the `vulkan` feature");
    }
}
