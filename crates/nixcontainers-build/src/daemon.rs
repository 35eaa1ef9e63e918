//! コンテナイメージデーモンへのアクセス
//!
//! ローダーとプラットフォームタスクは [`ImageDaemon`] を通してデーモンを扱う。
//! [`DockerDaemon`] は Docker Engine API による実装。

use crate::error::Result;
use crate::model::{ImageReference, LocalImage};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::BuildInfo;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::io;

/// パイプラインがコンテナイメージデーモンに求める操作
#[async_trait]
pub trait ImageDaemon: Send + Sync {
    /// イメージアーカイブをデーモンへ流し込む
    ///
    /// 戻り値はデーモンの進捗出力 (改行区切りの JSON)。アーカイブは返した
    /// ストリームを読み進めるのに合わせて消費される。
    async fn load_image(
        &self,
        archive: BoxStream<'static, Bytes>,
    ) -> Result<BoxStream<'static, io::Result<Bytes>>>;

    async fn tag_image(&self, source: &ImageReference, target: &ImageReference) -> Result<()>;

    async fn remove_image(&self, reference: &ImageReference) -> Result<()>;

    async fn inspect_image(&self, reference: &ImageReference) -> Result<LocalImage>;
}

/// Docker Engine 接続による [`ImageDaemon`]
#[derive(Debug, Clone)]
pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl ImageDaemon for DockerDaemon {
    async fn load_image(
        &self,
        archive: BoxStream<'static, Bytes>,
    ) -> Result<BoxStream<'static, io::Result<Bytes>>> {
        let options = bollard::query_parameters::ImportImageOptionsBuilder::default()
            .quiet(false)
            .build();

        let progress = self
            .docker
            .import_image_stream(options, archive, None)
            .filter_map(|item| {
                futures_util::future::ready(match item {
                    Ok(info) => progress_line(&info).map(Ok),
                    Err(e) => Some(Err(io::Error::other(e))),
                })
            });

        Ok(progress.boxed())
    }

    async fn tag_image(&self, source: &ImageReference, target: &ImageReference) -> Result<()> {
        let options = bollard::query_parameters::TagImageOptionsBuilder::default()
            .repo(&target.name())
            .tag(target.tag_or_default())
            .build();

        tracing::debug!(%source, %target, "tagging image");
        self.docker
            .tag_image(&source.to_string(), Some(options))
            .await?;
        Ok(())
    }

    async fn remove_image(&self, reference: &ImageReference) -> Result<()> {
        tracing::debug!(%reference, "removing image name");
        self.docker
            .remove_image(
                &reference.to_string(),
                None::<bollard::query_parameters::RemoveImageOptions>,
                None,
            )
            .await?;
        Ok(())
    }

    async fn inspect_image(&self, reference: &ImageReference) -> Result<LocalImage> {
        let inspect = self.docker.inspect_image(&reference.to_string()).await?;
        Ok(LocalImage {
            id: inspect.id.unwrap_or_default(),
            os: inspect.os,
            architecture: inspect.architecture,
            size: inspect.size,
        })
    }
}

/// デコード済みの進捗レコードを Engine API のワイヤ形式 (JSON 1行) に戻す
///
/// ローダーが使うフィールドを持たないレコード (`aux` のみなど) は `None`。
pub(crate) fn progress_line(info: &BuildInfo) -> Option<Bytes> {
    let mut record = serde_json::Map::new();
    let fields = [
        ("stream", &info.stream),
        ("status", &info.status),
        ("id", &info.id),
        ("progress", &info.progress),
        ("error", &info.error),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            record.insert(key.to_string(), serde_json::Value::from(value.as_str()));
        }
    }
    if let Some(detail) = &info.error_detail {
        record.insert(
            "errorDetail".to_string(),
            serde_json::json!({ "code": detail.code, "message": detail.message }),
        );
    }

    if !["stream", "status", "error", "errorDetail"]
        .iter()
        .any(|key| record.contains_key(*key))
    {
        return None;
    }

    let mut line = serde_json::Value::Object(record).to_string().into_bytes();
    line.push(b'\n');
    Some(Bytes::from(line))
}
