//! nix-containers の設定解決
//!
//! フラグと環境変数の束ね込みは CLI 側 (clap) で済ませる。ここではその値に
//! 既定値を補い、検証して [`Settings`] にまとめる。

pub mod error;

pub use error::*;

use nixcontainers_build::{BuildOptions, BuildRequest, ImageReference, Platform, RegistryOptions};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// `1`, `true`, `yes`, `on` (大文字小文字は問わない) を真とし、それ以外は偽
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `os/arch[,os/arch...]` をパースする。前後の空白と空要素は無視する。
pub fn parse_platforms(value: &str) -> Result<Vec<Platform>> {
    let platforms = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_platform)
        .collect::<Result<Vec<_>>>()?;

    if platforms.is_empty() {
        return Err(ConfigError::NoPlatforms(value.to_string()));
    }
    Ok(platforms)
}

fn parse_platform(value: &str) -> Result<Platform> {
    match value.split_once('/') {
        Some((os, arch)) if !os.trim().is_empty() && !arch.trim().is_empty() => {
            Ok(Platform::new(os.trim(), arch.trim()))
        }
        _ => Err(ConfigError::InvalidPlatform(value.to_string())),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// `EnvFilter` 用のディレクティブ
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "err" => Ok(LogLevel::Error),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}

/// コマンドラインでも `BUILD_CONTEXT` でもビルドコンテキストが
/// 指定されなかったときの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextDefault {
    /// カレントディレクトリを使う (`build` サブコマンド)
    CurrentDir,
    /// エラーにする (`skaffold build`)
    Required,
}

/// CLI が受け取った値。各フィールドはフラグ、なければ環境変数の値
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub image: Option<String>,
    pub platforms: Option<String>,
    pub build_context: Option<String>,
    pub push: bool,
    pub accept_flake_config: bool,
    pub log_level: Option<LogLevel>,
    pub insecure_registry: bool,
    pub nix: Option<PathBuf>,
}

/// 1回の実行で使う解決済みの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub image: ImageReference,
    pub platforms: Vec<Platform>,
    pub build_context: String,
    pub push: bool,
    pub accept_flake_config: bool,
    pub log_level: LogLevel,
    pub insecure_registry: bool,
    pub nix: PathBuf,
}

impl Settings {
    /// 既定値を補って検証する
    ///
    /// - タグのないイメージは `latest` になる
    /// - プラットフォーム未指定ならホストのプラットフォーム
    /// - nix 実行ファイル未指定なら `PATH` 上の `nix`
    pub fn resolve(inputs: Inputs, context_default: ContextDefault) -> Result<Self> {
        let image = non_blank(inputs.image).ok_or(ConfigError::MissingImage)?;
        let image =
            ImageReference::parse_tagged(&image).map_err(|e| ConfigError::InvalidImage {
                image: image.clone(),
                reason: e.to_string(),
            })?;

        let platforms = match non_blank(inputs.platforms) {
            Some(value) => parse_platforms(&value)?,
            None => {
                let host = Platform::host();
                tracing::debug!(detected = %host, "no platforms specified, using host");
                vec![host]
            }
        };

        let build_context = match non_blank(inputs.build_context) {
            Some(context) => context,
            None => match context_default {
                ContextDefault::CurrentDir => std::env::current_dir()?.display().to_string(),
                ContextDefault::Required => return Err(ConfigError::MissingBuildContext),
            },
        };

        Ok(Self {
            image,
            platforms,
            build_context,
            push: inputs.push,
            accept_flake_config: inputs.accept_flake_config,
            log_level: inputs.log_level.unwrap_or_default(),
            insecure_registry: inputs.insecure_registry,
            nix: inputs.nix.unwrap_or_else(|| PathBuf::from("nix")),
        })
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            push: self.push,
            accept_flake_config: self.accept_flake_config,
            registry: RegistryOptions {
                insecure: self.insecure_registry,
            },
        }
    }

    pub fn build_request(&self) -> BuildRequest {
        BuildRequest {
            build_context: self.build_context.clone(),
            reference: self.image.clone(),
            platforms: self.platforms.clone(),
        }
    }

    /// 解決済みの設定を info レベルで1度だけ出力
    pub fn log(&self) {
        let platforms = self
            .platforms
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            image = %self.image,
            platforms = %platforms,
            build_context = %self.build_context,
            push = self.push,
            accept_flake_config = self.accept_flake_config,
            insecure_registry = self.insecure_registry,
            "resolved settings"
        );
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
