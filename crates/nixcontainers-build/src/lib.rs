//! Nix flake イメージビルドパイプライン
//!
//! Nix flakes からコンテナイメージをビルドして Docker デーモンにロードし、
//! 単一またはマルチプラットフォームの結果をコンテナレジストリへ公開する。

pub mod auth;
pub mod builder;
pub mod daemon;
pub mod error;
pub mod loader;
pub mod model;
pub mod options;
pub mod orchestrator;
mod process;
pub mod registry;
pub mod task;

pub use auth::{Credential, Keychain};
pub use builder::{FlakeBuildOutput, FlakeBuilder, decode_build_results};
pub use daemon::{DockerDaemon, ImageDaemon};
pub use error::{BuildError, Result};
pub use loader::{load_stream, read_loaded_reference};
pub use model::{
    ImageReference, IndexEntry, LocalImage, ManifestDescriptor, MultiArchIndex, Platform,
    PlatformImage,
};
pub use options::{BuildOptions, RegistryOptions};
pub use orchestrator::{BuildRequest, Pipeline, Publication};
pub use registry::{
    DockerRegistry, Registry, descriptor_for_platform, encode_index, index_media_type,
    to_image_index,
};
pub use task::{PlatformTask, format_flake_package};
