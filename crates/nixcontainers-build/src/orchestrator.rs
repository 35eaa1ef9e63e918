//! ビルドパイプライン
//!
//! 単一プラットフォームは要求された参照へ直接ビルドする。複数プラットフォームは
//! プラットフォーム接尾辞付きのタグで並行ビルドしてプッシュし、最後に
//! マルチアーキテクチャのインデックスでまとめる。

use crate::builder::FlakeBuilder;
use crate::daemon::ImageDaemon;
use crate::error::{BuildError, Result, ResultExt};
use crate::model::{ImageReference, IndexEntry, MultiArchIndex, Platform, PlatformImage};
use crate::options::BuildOptions;
use crate::registry::Registry;
use crate::task::PlatformTask;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// ビルド対象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// `nix build` に渡す flake 参照 (例: `.`, `github:org/repo`)
    pub build_context: String,
    pub reference: ImageReference,
    pub platforms: Vec<Platform>,
}

impl BuildRequest {
    pub fn validate(&self) -> Result<()> {
        if self.platforms.is_empty() {
            return Err(BuildError::InvalidRequest(
                "at least one platform is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for platform in &self.platforms {
            if !seen.insert(platform) {
                return Err(BuildError::InvalidRequest(format!(
                    "platform {} requested more than once",
                    platform
                )));
            }
        }

        if self.reference.digest.is_some() {
            return Err(BuildError::InvalidRequest(format!(
                "cannot build to a digest reference: {}",
                self.reference
            )));
        }
        Ok(())
    }

    /// 公開する参照。タグ省略時はデフォルトタグを補う
    pub fn canonical_reference(&self) -> ImageReference {
        let mut canonical = self.reference.clone();
        if canonical.tag.is_none() {
            canonical.tag = Some(crate::model::DEFAULT_TAG.to_string());
        }
        canonical
    }
}

/// 成功時の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    /// 単一プラットフォーム、デーモンに残したまま
    Local(PlatformImage),
    /// 単一プラットフォーム、正規の参照でプッシュ済み
    Image(PlatformImage),
    /// 複数プラットフォーム、1 つのインデックスとして公開済み
    Index {
        reference: ImageReference,
        digest: String,
        index: MultiArchIndex,
        images: Vec<PlatformImage>,
    },
}

impl Publication {
    pub fn reference(&self) -> &ImageReference {
        match self {
            Publication::Local(image) | Publication::Image(image) => &image.reference,
            Publication::Index { reference, .. } => reference,
        }
    }

    pub fn images(&self) -> &[PlatformImage] {
        match self {
            Publication::Local(image) | Publication::Image(image) => std::slice::from_ref(image),
            Publication::Index { images, .. } => images,
        }
    }

    pub fn is_pushed(&self) -> bool {
        !matches!(self, Publication::Local(_))
    }
}

/// デーモンとレジストリに対してプラットフォームごとのタスクを実行する
pub struct Pipeline<D: ?Sized, R: ?Sized> {
    daemon: Arc<D>,
    registry: Arc<R>,
    builder: FlakeBuilder,
    options: BuildOptions,
}

impl<D: ?Sized, R: ?Sized> Clone for Pipeline<D, R> {
    fn clone(&self) -> Self {
        Self {
            daemon: Arc::clone(&self.daemon),
            registry: Arc::clone(&self.registry),
            builder: self.builder.clone(),
            options: self.options,
        }
    }
}

impl<D, R> Pipeline<D, R>
where
    D: ImageDaemon + ?Sized + 'static,
    R: Registry + ?Sized + 'static,
{
    pub fn new(daemon: Arc<D>, registry: Arc<R>, options: BuildOptions) -> Self {
        Self {
            daemon,
            registry,
            builder: FlakeBuilder::new(options.accept_flake_config),
            options,
        }
    }

    /// デフォルトの `nix` 呼び出しを差し替える
    pub fn with_builder(mut self, builder: FlakeBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// 要求された全プラットフォームをビルドして結果を公開する
    ///
    /// `cancel` がキャンセルされると実行中のビルドを kill し
    /// [`BuildError::Cancelled`] を返す。失敗前にプッシュしたイメージは
    /// レジストリに残る。
    pub async fn run(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<Publication> {
        request.validate()?;
        let canonical = request.canonical_reference();

        match request.platforms.as_slice() {
            [platform] => {
                self.run_single(&request.build_context, platform, &canonical, cancel)
                    .await
            }
            platforms => {
                self.run_multi(&request.build_context, platforms, &canonical, cancel)
                    .await
            }
        }
    }

    async fn run_single(
        &self,
        build_context: &str,
        platform: &Platform,
        canonical: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<Publication> {
        tracing::info!(%platform, reference = %canonical, "building single-platform image");

        let namespace = Mutex::new(());
        let task = PlatformTask {
            builder: &self.builder,
            daemon: self.daemon.as_ref(),
            namespace: &namespace,
        };
        let image = cancellable(
            cancel,
            task.build_platform(build_context, platform, canonical, canonical),
        )
        .await?;

        if !self.options.push {
            return Ok(Publication::Local(image));
        }

        cancellable(cancel, async {
            self.registry
                .push_image(canonical, &image.content)
                .await
                .context(format!("push {}", platform))
        })
        .await?;

        tracing::info!(reference = %canonical, "image pushed");
        Ok(Publication::Image(image))
    }

    async fn run_multi(
        &self,
        build_context: &str,
        platforms: &[Platform],
        canonical: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<Publication> {
        if !self.options.push {
            return Err(BuildError::UnsupportedOperation(format!(
                "building {} platforms without pushing; a multi-platform image only exists as a registry index",
                platforms.len()
            )));
        }

        let targets = platforms
            .iter()
            .map(|platform| canonical.with_platform_suffix(platform))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            platforms = platforms.len(),
            reference = %canonical,
            "building multi-platform image"
        );

        let namespace = Arc::new(Mutex::new(()));
        let mut tasks = JoinSet::new();
        for (position, (platform, target)) in platforms.iter().cloned().zip(targets).enumerate() {
            let daemon = Arc::clone(&self.daemon);
            let registry = Arc::clone(&self.registry);
            let builder = self.builder.clone();
            let namespace = Arc::clone(&namespace);
            let build_context = build_context.to_string();
            let canonical = canonical.clone();

            tasks.spawn(async move {
                let task = PlatformTask {
                    builder: &builder,
                    daemon: daemon.as_ref(),
                    namespace: namespace.as_ref(),
                };
                let image = task
                    .build_platform(&build_context, &platform, &canonical, &target)
                    .await?;

                registry
                    .push_image(&target, &image.content)
                    .await
                    .context(format!("push {}", platform))?;
                let manifest = registry
                    .manifest_descriptor(&target, &platform)
                    .await
                    .context(format!("resolve {}", platform))?;

                tracing::info!(%platform, reference = %target, digest = %manifest.digest, "platform image pushed");
                Ok::<_, BuildError>((position, IndexEntry { manifest, platform }, image))
            });
        }

        let mut completed = Vec::with_capacity(platforms.len());
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.shutdown().await;
                    return Err(BuildError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            match joined.map_err(BuildError::from).and_then(|outcome| outcome) {
                Ok(done) => completed.push(done),
                Err(e) => {
                    tasks.shutdown().await;
                    return Err(e.context("push images"));
                }
            }
        }

        completed.sort_by_key(|(position, ..)| *position);
        let mut index = MultiArchIndex::new();
        let mut images = Vec::with_capacity(completed.len());
        for (_, entry, image) in completed {
            index.push(entry)?;
            images.push(image);
        }

        let digest = cancellable(cancel, async {
            self.registry
                .push_index(canonical, &index)
                .await
                .context("push index")
        })
        .await?;

        tracing::info!(reference = %canonical, %digest, "image index pushed");
        Ok(Publication::Index {
            reference: canonical.clone(),
            digest,
            index,
            images,
        })
    }
}

/// `cancel` が先に発火しなければ `future` を実行する。発火したら future は drop される
async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BuildError::Cancelled),
        result = future => result,
    }
}
