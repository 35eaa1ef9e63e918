//! レジストリへの公開
//!
//! プラットフォーム別イメージはデーモン経由でプッシュする。マニフェストの
//! 参照とマルチアーキテクチャのインデックスはレジストリと直接やり取りする。

use crate::auth::Keychain;
use crate::error::{BuildError, Result};
use crate::model::{
    ImageReference, IndexEntry, LocalImage, ManifestDescriptor, MultiArchIndex, Platform,
};
use crate::options::RegistryOptions;
use async_trait::async_trait;
use bollard::Docker;
use futures_util::StreamExt;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{
    IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE, ImageIndexEntry,
    OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE, OciImageIndex,
};
use oci_distribution::{Client, Reference, RegistryOperation};
use reqwest::header::HeaderValue;

/// マニフェスト取得時に受け付けるメディアタイプ
const ACCEPTED_MANIFEST_TYPES: [&str; 4] = [
    IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
];

/// パイプラインがイメージレジストリに求める操作
#[async_trait]
pub trait Registry: Send + Sync {
    /// デーモン上のイメージを `reference` として公開する
    async fn push_image(&self, reference: &ImageReference, image: &LocalImage) -> Result<()>;

    /// `reference` に保存されている `platform` 用マニフェストの記述子
    async fn manifest_descriptor(
        &self,
        reference: &ImageReference,
        platform: &Platform,
    ) -> Result<ManifestDescriptor>;

    /// `index` を `reference` として公開し、その digest を返す
    async fn push_index(&self, reference: &ImageReference, index: &MultiArchIndex)
    -> Result<String>;
}

/// 子マニフェストの組み合わせに応じたインデックスのメディアタイプ
///
/// すべて Docker schema 2 なら Docker manifest list、それ以外は OCI image index。
pub fn index_media_type(entries: &[IndexEntry]) -> &'static str {
    if !entries.is_empty()
        && entries
            .iter()
            .all(|e| e.manifest.media_type == IMAGE_MANIFEST_MEDIA_TYPE)
    {
        IMAGE_MANIFEST_LIST_MEDIA_TYPE
    } else {
        OCI_IMAGE_INDEX_MEDIA_TYPE
    }
}

/// [`MultiArchIndex`] のワイヤ形式。エントリの順序は保つ
pub fn to_image_index(index: &MultiArchIndex) -> OciImageIndex {
    let manifests = index
        .entries()
        .iter()
        .map(|entry| ImageIndexEntry {
            media_type: entry.manifest.media_type.clone(),
            digest: entry.manifest.digest.clone(),
            size: entry.manifest.size,
            platform: Some(oci_distribution::manifest::Platform {
                architecture: entry.platform.arch.clone(),
                os: entry.platform.os.clone(),
                os_version: None,
                os_features: None,
                variant: None,
                features: None,
            }),
            annotations: None,
        })
        .collect();

    OciImageIndex {
        schema_version: 2,
        media_type: Some(index_media_type(index.entries()).to_string()),
        manifests,
        annotations: None,
    }
}

/// インデックスを送信するバイト列と、そのバイト列の digest
///
/// レジストリは受け取ったバイト列をそのまま保存するため、プッシュには必ず
/// この `body` を使うこと。
pub fn encode_index(index: &MultiArchIndex) -> serde_json::Result<(Vec<u8>, String)> {
    let body = serde_json::to_vec(&to_image_index(index))?;
    let digest = sha256_digest(&body);
    Ok((body, digest))
}

/// 生のマニフェスト本体とレジストリが返した digest から `platform` 用の記述子を得る
///
/// 本体がインデックス (containerd イメージストアからのプッシュなど) の場合は、
/// `platform` に一致する子マニフェストを選ぶ。
pub fn descriptor_for_platform(
    body: &[u8],
    digest: String,
    platform: &Platform,
) -> std::result::Result<ManifestDescriptor, String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid manifest: {}", e))?;
    let media_type = value
        .get("mediaType")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let is_index = match media_type.as_deref() {
        Some(IMAGE_MANIFEST_LIST_MEDIA_TYPE | OCI_IMAGE_INDEX_MEDIA_TYPE) => true,
        Some(_) => false,
        None => value.get("manifests").is_some(),
    };

    if !is_index {
        return Ok(ManifestDescriptor {
            media_type: media_type.unwrap_or_else(|| IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
            digest,
            size: body.len() as i64,
        });
    }

    let index: OciImageIndex =
        serde_json::from_value(value).map_err(|e| format!("invalid image index: {}", e))?;
    index
        .manifests
        .into_iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == platform.os && p.architecture == platform.arch)
        })
        .map(|m| ManifestDescriptor {
            media_type: m.media_type,
            digest: m.digest,
            size: m.size,
        })
        .ok_or_else(|| format!("image index {} has no manifest for {}", digest, platform))
}

/// イメージのプッシュは Docker デーモン、マニフェストは OCI distribution
/// クライアントで扱う [`Registry`]
pub struct DockerRegistry {
    docker: Docker,
    client: Client,
    keychain: Keychain,
}

impl DockerRegistry {
    pub fn new(docker: Docker, options: RegistryOptions) -> Self {
        Self::with_keychain(docker, options, Keychain::new())
    }

    pub fn with_keychain(docker: Docker, options: RegistryOptions, keychain: Keychain) -> Self {
        let protocol = if options.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });

        Self {
            docker,
            client,
            keychain,
        }
    }

    fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
        reference
            .to_string()
            .parse::<Reference>()
            .map_err(|e| BuildError::InvalidReference {
                reference: reference.to_string(),
                reason: e.to_string(),
            })
    }

    fn registry_error(reference: &ImageReference, e: impl std::fmt::Display) -> BuildError {
        BuildError::Registry {
            reference: reference.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Registry for DockerRegistry {
    async fn push_image(&self, reference: &ImageReference, image: &LocalImage) -> Result<()> {
        let credentials = self
            .keychain
            .docker_credentials(reference.registry_host())
            .await?;

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> {
            tag: reference.tag_or_default().to_string(),
        };

        tracing::info!(%reference, image = %image.id, "pushing image");

        #[allow(deprecated)]
        let mut stream = self
            .docker
            .push_image(&reference.name(), Some(options), credentials);

        let mut error_message: Option<String> = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(err) = info.error {
                        error_message = Some(err);
                    } else if let Some(status) = info.status {
                        tracing::debug!(source = "daemon", "{}", status);
                    }
                }
                Err(e) => {
                    return Err(BuildError::Push {
                        reference: reference.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(message) = error_message {
            return Err(BuildError::Push {
                reference: reference.to_string(),
                message,
            });
        }

        Ok(())
    }

    async fn manifest_descriptor(
        &self,
        reference: &ImageReference,
        platform: &Platform,
    ) -> Result<ManifestDescriptor> {
        let oci_ref = Self::to_oci_reference(reference)?;
        let auth = self
            .keychain
            .registry_auth(reference.registry_host())
            .await?;

        let (body, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, &ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| Self::registry_error(reference, e))?;

        let descriptor = descriptor_for_platform(&body, digest, platform)
            .map_err(|e| Self::registry_error(reference, e))?;
        tracing::debug!(
            %reference,
            digest = %descriptor.digest,
            media_type = %descriptor.media_type,
            "resolved manifest"
        );
        Ok(descriptor)
    }

    async fn push_index(
        &self,
        reference: &ImageReference,
        index: &MultiArchIndex,
    ) -> Result<String> {
        let oci_ref = Self::to_oci_reference(reference)?;
        let auth = self
            .keychain
            .registry_auth(reference.registry_host())
            .await?;

        self.client
            .auth(&oci_ref, &auth, RegistryOperation::Push)
            .await
            .map_err(|e| BuildError::AuthFailed {
                registry: reference.registry_host().to_string(),
                message: e.to_string(),
            })?;

        let media_type = index_media_type(index.entries());
        let (body, digest) =
            encode_index(index).map_err(|e| Self::registry_error(reference, e))?;

        tracing::info!(%reference, manifests = index.len(), %digest, "pushing image index");
        self.client
            .push_manifest_raw(&oci_ref, body, HeaderValue::from_static(media_type))
            .await
            .map_err(|e| Self::registry_error(reference, e))?;

        Ok(digest)
    }
}

/// マニフェスト本体の `sha256:<hex>` digest
fn sha256_digest(body: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{:x}", Sha256::digest(body))
}
