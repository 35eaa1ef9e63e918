//! Nix flake のビルド
//!
//! 1 パッケージに対して `nix build --json` を実行し、ビルドされた
//! イメージストリーム生成スクリプトのストアパスを返す。

use crate::error::{BuildError, Result};
use crate::process::drain_diagnostics;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// `nix build --json` の結果配列の 1 要素
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlakeBuildOutput {
    pub drv_path: String,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub stop_time: Option<i64>,
}

impl FlakeBuildOutput {
    pub fn out_path(&self) -> Option<&str> {
        self.outputs.get("out").map(String::as_str)
    }
}

/// ビルダーの stdout をデコードする。結果の JSON 配列以外は `Parse` エラー。
/// 空配列はここでは通し、後で `NoOutput` として扱う
pub fn decode_build_results(package: &str, stdout: &[u8]) -> Result<Vec<FlakeBuildOutput>> {
    serde_json::from_slice(stdout).map_err(|source| BuildError::Parse {
        package: package.to_string(),
        source,
    })
}

/// Nix CLI を呼び出す
#[derive(Debug, Clone)]
pub struct FlakeBuilder {
    program: PathBuf,
    accept_flake_config: bool,
}

impl Default for FlakeBuilder {
    fn default() -> Self {
        Self::new(false)
    }
}

impl FlakeBuilder {
    pub fn new(accept_flake_config: bool) -> Self {
        Self {
            program: PathBuf::from("nix"),
            accept_flake_config,
        }
    }

    /// `nix` の代わりに別の実行ファイルを使う
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn args(&self, package: &str) -> Vec<String> {
        let mut args = vec!["build".to_string()];
        if self.accept_flake_config {
            args.push("--accept-flake-config".to_string());
        }
        args.push("--json".to_string());
        args.push(package.to_string());
        args
    }

    /// `package` をビルドし、最初の結果の `out` パスを返す
    ///
    /// ビルダーの終了まで待つ。future を drop するとビルダーは kill される。
    pub async fn build(&self, package: &str) -> Result<PathBuf> {
        let program = self.program.display().to_string();
        let args = self.args(package);
        tracing::debug!(cmd = %program, ?args, "running command");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuildError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (Some(mut stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(BuildError::Pipe {
                program,
                source: std::io::Error::other("stdio not captured"),
            });
        };

        let (drained, read) = tokio::join!(drain_diagnostics(stderr, package), async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });

        let status = child.wait().await.map_err(|source| BuildError::Pipe {
            program: program.clone(),
            source,
        })?;

        let outcome = Self::outcome(package, &program, status, read);
        let drain_error = drained
            .err()
            .map(|source| BuildError::Diagnostics { program, source });

        match (outcome, drain_error) {
            (Ok(path), None) => Ok(path),
            (Ok(_), Some(drain_error)) => Err(drain_error),
            (Err(e), None) => Err(e),
            (Err(e), Some(drain_error)) => Err(BuildError::Multiple(vec![e, drain_error])),
        }
    }

    fn outcome(
        package: &str,
        program: &str,
        status: ExitStatus,
        stdout: std::io::Result<Vec<u8>>,
    ) -> Result<PathBuf> {
        if !status.success() {
            return Err(BuildError::BuildFailed {
                package: package.to_string(),
                status,
            });
        }

        let stdout = stdout.map_err(|source| BuildError::Pipe {
            program: program.to_string(),
            source,
        })?;
        let results = decode_build_results(package, &stdout)?;

        let first = results
            .first()
            .ok_or_else(|| BuildError::NoOutput(package.to_string()))?;
        let out = first
            .out_path()
            .ok_or_else(|| BuildError::NoOutput(package.to_string()))?;

        tracing::debug!(
            package,
            drv_path = %first.drv_path,
            out,
            "nix build completed"
        );
        Ok(PathBuf::from(out))
    }
}
