//! プラットフォームごとのビルド: nix build、デーモンへのロード、リネーム

use crate::builder::FlakeBuilder;
use crate::daemon::ImageDaemon;
use crate::error::{BuildError, Result, ResultExt};
use crate::loader::load_stream;
use crate::model::{ImageReference, Platform, PlatformImage};
use tokio::sync::Mutex;

/// `platform` 向け `package` の flake 出力属性 (例: `./app#packages.x86_64-linux.app`)
pub fn format_flake_package(build_context: &str, platform: &Platform, package: &str) -> String {
    format!(
        "{}#packages.{}.{}",
        build_context,
        platform.nix_system(),
        package
    )
}

/// 1 プラットフォーム分のイメージをデーモンへビルドする
///
/// `namespace` はアーカイブのロードからターゲット名へのリネームまで、デーモン上の
/// イメージ名を保護する。1 回の実行の全タスクで同じものを共有すること。
///
/// このためロードとリネームはプラットフォーム間で 1 つずつ順番に行われる。
/// `nix build` とロード後の inspect はロックの外なので並行して進む。
pub struct PlatformTask<'a, D: ?Sized> {
    pub builder: &'a FlakeBuilder,
    pub daemon: &'a D,
    pub namespace: &'a Mutex<()>,
}

impl<D> PlatformTask<'_, D>
where
    D: ImageDaemon + ?Sized,
{
    /// `canonical` のパッケージを `platform` 向けにビルドし、デーモンに `target`
    /// として残す
    ///
    /// 失敗時の後片付けはしない。
    pub async fn build_platform(
        &self,
        build_context: &str,
        platform: &Platform,
        canonical: &ImageReference,
        target: &ImageReference,
    ) -> Result<PlatformImage> {
        let package = format_flake_package(build_context, platform, canonical.package_name());
        tracing::info!(%platform, %package, "building image");

        let producer = self
            .builder
            .build(&package)
            .await
            .context(format!("build {}", platform))?;

        {
            let _namespace = self.namespace.lock().await;

            let loaded = load_stream(self.daemon, &producer)
                .await
                .context(format!("load {}", platform))?;

            if !names_match(&loaded, target) {
                self.rename(&loaded, target).await?;
            }
        }

        let content = self
            .daemon
            .inspect_image(target)
            .await
            .context(format!("inspect {}", platform))?;

        if content.mismatches(platform) {
            tracing::warn!(
                %platform,
                image_os = content.os.as_deref().unwrap_or("unknown"),
                image_arch = content.architecture.as_deref().unwrap_or("unknown"),
                "built image does not match the requested platform"
            );
        }

        tracing::info!(%platform, reference = %target, "image ready");
        Ok(PlatformImage {
            platform: platform.clone(),
            reference: target.clone(),
            content,
        })
    }

    /// `loaded` に `target` のタグを付け、古い名前を外す。イメージ ID は
    /// 削除しない (イメージ自体が消える)
    async fn rename(&self, loaded: &ImageReference, target: &ImageReference) -> Result<()> {
        let tag_error = |source: BuildError| BuildError::Tag {
            from: loaded.to_string(),
            to: target.to_string(),
            source: Box::new(source),
        };

        self.daemon
            .tag_image(loaded, target)
            .await
            .map_err(tag_error)?;

        if !loaded.is_image_id() {
            self.daemon
                .remove_image(loaded)
                .await
                .map_err(tag_error)?;
        }
        Ok(())
    }
}

/// 2つの参照がデーモン上の同じタグを指すか。タグ省略は `latest` とみなし、
/// 名前は Docker の短縮形で比べる。
fn names_match(a: &ImageReference, b: &ImageReference) -> bool {
    a.digest.is_none()
        && b.digest.is_none()
        && a.familiar_name() == b.familiar_name()
        && a.tag_or_default() == b.tag_or_default()
}
