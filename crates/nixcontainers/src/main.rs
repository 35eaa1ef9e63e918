mod docker;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use nixcontainers_build::{DockerDaemon, DockerRegistry, FlakeBuilder, Pipeline, Publication};
use nixcontainers_config::{ContextDefault, Inputs, LogLevel, Settings, parse_bool};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nix-containers", version)]
#[command(about = "Nix flakes から OCI イメージをビルドして公開する", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// flake からイメージをビルド
    Build {
        /// ビルド元の flake (省略時はカレントディレクトリ)
        #[arg(value_name = "BUILD_CONTEXT")]
        build_context: Option<String>,
        #[command(flatten)]
        args: BuildArgs,
    },
    /// Skaffold のカスタムビルダー
    #[command(subcommand)]
    Skaffold(SkaffoldCommands),
}

#[derive(Subcommand)]
enum SkaffoldCommands {
    /// Skaffold が IMAGE, PUSH_IMAGE, BUILD_CONTEXT, PLATFORMS で指定した
    /// アーティファクトをビルド
    Build {
        #[command(flatten)]
        args: BuildArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct BuildArgs {
    /// 生成するイメージ参照
    #[arg(short, long, env = "IMAGE")]
    image: Option<String>,
    /// カンマ区切りの os/arch 一覧 (例: linux/amd64,linux/arm64)
    #[arg(short, long, env = "PLATFORMS")]
    platforms: Option<String>,
    /// ビルド元の flake
    #[arg(long = "build-context", value_name = "FLAKE", env = "BUILD_CONTEXT")]
    build_context_flag: Option<String>,
    /// ビルド結果をレジストリへプッシュする
    #[arg(long, env = "PUSH_IMAGE", value_parser = parse_flag)]
    push: bool,
    /// nix に --accept-flake-config を渡す
    #[arg(long, env = "ACCEPT_FLAKE_CONFIG", value_parser = parse_flag)]
    accept_flake_config: bool,
    /// debug, info, warn, error のいずれか
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<LogLevel>,
    /// レジストリに平文 HTTP で接続する
    #[arg(long, env = "INSECURE_REGISTRY", value_parser = parse_flag)]
    insecure_registry: bool,
    /// nix 実行ファイル
    #[arg(long, value_name = "PATH", env = "NIX_BIN")]
    nix: Option<PathBuf>,
}

/// 環境変数の真偽値。`1`, `true`, `yes`, `on` 以外は偽
fn parse_flag(value: &str) -> Result<bool, String> {
    Ok(parse_bool(value))
}

impl BuildArgs {
    fn into_inputs(self, build_context: Option<String>) -> Inputs {
        Inputs {
            image: self.image,
            platforms: self.platforms,
            build_context: build_context.or(self.build_context_flag),
            push: self.push,
            accept_flake_config: self.accept_flake_config,
            log_level: self.log_level,
            insecure_registry: self.insecure_registry,
            nix: self.nix,
        }
    }
}

impl Commands {
    fn into_inputs(self) -> (Inputs, ContextDefault) {
        match self {
            Commands::Build {
                build_context,
                args,
            } => (args.into_inputs(build_context), ContextDefault::CurrentDir),
            Commands::Skaffold(SkaffoldCommands::Build { args }) => {
                (args.into_inputs(None), ContextDefault::Required)
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (inputs, context_default) = cli.command.into_inputs();
    let settings = Settings::resolve(inputs, context_default)?;
    init_tracing(settings.log_level);
    settings.log();

    let docker = docker::connect().await?;
    let options = settings.build_options();
    let daemon = Arc::new(DockerDaemon::new(docker.clone()));
    let registry = Arc::new(DockerRegistry::new(docker, options.registry));
    let pipeline = Pipeline::new(daemon, registry, options)
        .with_builder(FlakeBuilder::new(options.accept_flake_config).with_program(&settings.nix));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping builds");
            interrupt.cancel();
        }
    });

    let publication = pipeline
        .run(&settings.build_request(), &cancel)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    print_summary(&publication);
    Ok(())
}

/// ログは stderr へ。`RUST_LOG` があればそちらを優先する
fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn print_summary(publication: &Publication) {
    match publication {
        Publication::Local(image) => {
            println!(
                "{} ビルド完了: {} ({})",
                "✓".green().bold(),
                image.reference.to_string().cyan(),
                image.platform
            );
        }
        Publication::Image(image) => {
            println!(
                "{} プッシュ完了: {} ({})",
                "✓".green().bold(),
                image.reference.to_string().cyan(),
                image.platform
            );
        }
        Publication::Index {
            reference,
            digest,
            images,
            ..
        } => {
            println!(
                "{} プッシュ完了: {}@{}",
                "✓".green().bold(),
                reference.to_string().cyan(),
                digest.dimmed()
            );
            for image in images {
                println!("  → {} {}", image.platform, image.reference);
            }
        }
    }
}
