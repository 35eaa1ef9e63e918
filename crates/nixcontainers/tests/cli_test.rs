#![allow(deprecated)] // cargo_bin

use assert_cmd::Command;
use predicates::prelude::*;

const ENV_VARS: [&str; 8] = [
    "IMAGE",
    "PLATFORMS",
    "BUILD_CONTEXT",
    "PUSH_IMAGE",
    "ACCEPT_FLAKE_CONFIG",
    "LOG_LEVEL",
    "INSECURE_REGISTRY",
    "NIX_BIN",
];

fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("nix-containers").unwrap();
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_cli_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nix flakes"))
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("skaffold"));
}

#[test]
fn test_build_help() {
    cmd()
        .args(["build", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[BUILD_CONTEXT]"))
        .stdout(predicate::str::contains("--image"))
        .stdout(predicate::str::contains("--platforms"))
        .stdout(predicate::str::contains("--push"))
        .stdout(predicate::str::contains("--accept-flake-config"));
}

#[test]
fn test_skaffold_build_help() {
    cmd()
        .args(["skaffold", "build", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PUSH_IMAGE"));
}

#[test]
fn test_missing_image_fails() {
    cmd()
        .arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::contains("IMAGE"));
}

#[test]
fn test_invalid_log_level_fails() {
    cmd()
        .args(["build", "--image", "app:v1"])
        .env("LOG_LEVEL", "loud")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log level"));
}

#[test]
fn test_invalid_platform_fails() {
    cmd()
        .args(["build", "--image", "app:v1", "--platforms", "linux"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid platform"));
}

#[test]
fn test_skaffold_requires_build_context() {
    cmd()
        .args(["skaffold", "build"])
        .env("IMAGE", "app:v1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("BUILD_CONTEXT"));
}

#[test]
fn test_invalid_image_fails() {
    cmd()
        .args(["build", "--image", "Not/Valid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid image"));
}
