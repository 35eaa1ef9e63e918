use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Invalid build request: {0}")]
    InvalidRequest(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read output of {program}: {source}")]
    Pipe {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to drain diagnostics of {program}: {source}")]
    Diagnostics {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse builder output for {package}: {source}")]
    Parse {
        package: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Builder produced no output path for {0}")]
    NoOutput(String),

    #[error("Builder failed for {package}: {status}")]
    BuildFailed { package: String, status: ExitStatus },

    #[error("Image stream producer {} exited with {status}", .path.display())]
    ProducerFailed { path: PathBuf, status: ExitStatus },

    #[error("Daemon load protocol violation: {0}")]
    Protocol(String),

    #[error("Daemon rejected the image stream: {0}")]
    LoadRejected(String),

    #[error("Daemon load stream ended without reporting a loaded image")]
    NoLoadedRef,

    #[error("Failed to tag {from} as {to}: {source}")]
    Tag {
        from: String,
        to: String,
        #[source]
        source: Box<BuildError>,
    },

    #[error("Failed to push {reference}: {message}")]
    Push { reference: String, message: String },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Registry error for {reference}: {message}")]
    Registry { reference: String, message: String },

    #[error("Authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("Build cancelled")]
    Cancelled,

    #[error("Platform task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<BuildError>,
    },

    #[error("{}", join_messages(.0))]
    Multiple(Vec<BuildError>),
}

fn join_messages(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BuildError {
    /// エラーを発生させたステップ名で包む
    pub fn context(self, context: impl Into<String>) -> Self {
        BuildError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// ステップのラッパーを外した最も内側のエラー
    pub fn root(&self) -> &BuildError {
        match self {
            BuildError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// 独立した複数の失敗を 1 つのエラーにまとめる。報告するものがなければ `None`
    pub fn join(mut errors: Vec<BuildError>) -> Option<BuildError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(BuildError::Multiple(errors)),
        }
    }

    /// 対処方法のヒント付きメッセージ
    pub fn user_message(&self) -> String {
        match self.root() {
            BuildError::NoOutput(package) => format!(
                "{}\n\
                 \n\
                 flake の評価は成功しましたが `out` パスがありません。\n\
                 `{}` が streamLayeredImage のパッケージか確認してください。",
                self, package
            ),
            BuildError::BuildFailed { .. } => format!(
                "{}\n\
                 \n\
                 LOG_LEVEL=debug で再実行すると nix build のログを確認できます。",
                self
            ),
            BuildError::UnsupportedOperation(_) => format!(
                "{}\n\
                 \n\
                 マルチプラットフォームイメージはインデックスとしてのみ公開できます。\n\
                 --push (PUSH_IMAGE=true) を指定するか、単一プラットフォームでビルドしてください。",
                self
            ),
            BuildError::DockerConnection(_) => format!(
                "{}\n\
                 \n\
                 Dockerデーモンが起動しているか、DOCKER_HOST が正しいか確認してください。",
                self
            ),
            _ => format!("{}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

pub(crate) trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
