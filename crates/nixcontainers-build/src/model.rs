//! プラットフォームとイメージ参照の値型

use crate::error::{BuildError, Result};
use std::fmt;
use std::str::FromStr;

/// 参照にタグがないときに使うタグ
pub const DEFAULT_TAG: &str = "latest";

/// イメージのターゲットプラットフォーム (`os/arch`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// このバイナリのビルド対象アーキテクチャ上の Linux
    ///
    /// イメージは常に Linux で動くため、ホストの OS は見ない。
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self::new("linux", arch)
    }

    /// Nix のシステム名 (例: `x86_64-linux`)
    pub fn nix_system(&self) -> String {
        let arch = match self.arch.as_str() {
            "amd64" => "x86_64",
            "arm64" => "aarch64",
            "arm32" => "armv7l",
            other => other,
        };
        format!("{}-{}", arch, self.os)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// パース済みのイメージ参照 (`[registry/]repository[:tag][@digest]`)
///
/// デフォルトのレジストリは補わないので、`Display` はデーモンやユーザーが
/// 書いたとおりの文字列を返す。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// イメージ参照文字列をパースする
    ///
    /// - `nginx` → リポジトリ `nginx`、タグなし
    /// - `ghcr.io/org/app:v1` → レジストリ `ghcr.io`、リポジトリ `org/app`、タグ `v1`
    /// - `localhost:5000/app` → レジストリ `localhost:5000`、リポジトリ `app`
    /// - `ghcr.io/org/app@sha256:abc` → ダイジェスト `sha256:abc`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let invalid = |reason: &str| BuildError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid("digest must be algorithm:hex"));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // タグの区切りは最後の "/" より後にしか現れない
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon = last_segment_start + colon;
                let candidate = &name_tag[colon + 1..];
                // リポジトリパスのない registry:port
                if last_segment_start == 0
                    && digest.is_none()
                    && !candidate.is_empty()
                    && candidate.chars().all(|c| c.is_ascii_digit())
                    && name_tag[..colon].contains('.')
                {
                    (name_tag, None)
                } else {
                    (&name_tag[..colon], Some(candidate.to_string()))
                }
            }
            None => (name_tag, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest.to_string())
            }
            _ => (None, name.to_string()),
        };

        if repository.is_empty() {
            return Err(invalid("empty repository"));
        }
        if repository
            .chars()
            .any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c)))
        {
            return Err(invalid("repository may only contain [a-z0-9._/-]"));
        }
        if let Some(tag) = &tag {
            validate_tag(tag).map_err(|reason| invalid(&reason))?;
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// 公開先のタグを指す参照をパースする。タグ省略時は `latest`、
    /// ダイジェストはエラー
    pub fn parse_tagged(reference: &str) -> Result<Self> {
        let mut parsed = Self::parse(reference)?;
        if parsed.digest.is_some() {
            return Err(BuildError::InvalidReference {
                reference: reference.to_string(),
                reason: "a tag is required, not a digest".to_string(),
            });
        }
        if parsed.tag.is_none() {
            parsed.tag = Some(DEFAULT_TAG.to_string());
        }
        Ok(parsed)
    }

    /// レジストリホストを含むリポジトリ名 (タグとダイジェストは含まない)
    pub fn name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// Docker が表示する短縮名。Docker Hub では `docker.io/` (`index.docker.io/`)
    /// を省き、公式イメージの `library/` も省く。
    ///
    /// `docker.io/myuser/app` と `myuser/app`、`docker.io/library/nginx` と
    /// `nginx` はデーモン上で同じ名前になる。
    pub fn familiar_name(&self) -> String {
        match self.registry.as_deref() {
            None | Some("docker.io") | Some("index.docker.io") => self
                .repository
                .strip_prefix("library/")
                .filter(|rest| !rest.contains('/'))
                .unwrap_or(&self.repository)
                .to_string(),
            Some(registry) => format!("{}/{}", registry, self.repository),
        }
    }

    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// 参照先のレジストリホスト (省略時は `docker.io`)
    pub fn registry_host(&self) -> &str {
        self.registry.as_deref().unwrap_or("docker.io")
    }

    /// リポジトリの最後のパス要素。flake のパッケージ名に使う
    pub fn package_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// タグに `_{os}_{arch}` を付けた同じリポジトリ
    ///
    /// 複数プラットフォームを並行ビルドする間、デーモン上で名前が衝突しないようにする。
    pub fn with_platform_suffix(&self, platform: &Platform) -> Result<Self> {
        let tag = format!(
            "{}_{}_{}",
            self.tag_or_default(),
            platform.os,
            platform.arch
        );
        validate_tag(&tag).map_err(|reason| BuildError::InvalidReference {
            reference: format!("{}:{}", self.name(), tag),
            reason,
        })?;
        Ok(Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag),
            digest: None,
        })
    }

    /// 名前なしでロードされたイメージに対してデーモンが返す `sha256:<hex>` なら true
    pub fn is_image_id(&self) -> bool {
        self.registry.is_none()
            && self.repository == "sha256"
            && self.digest.is_none()
            && self
                .tag
                .as_deref()
                .is_some_and(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Docker のタグ制約: `[A-Za-z0-9_.-]` の 1..=128 文字で、`.` と `-` では始まらない
fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    if tag.is_empty() {
        return Err("empty tag".to_string());
    }
    if tag.len() > 128 {
        return Err(format!("tag too long ({} characters, max 128)", tag.len()));
    }
    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(format!("tag may not start with '.' or '-': {}", tag));
    }
    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        return Err(format!("invalid character '{}' in tag: {}", c, tag));
    }
    Ok(())
}

/// デーモンから見たロード済みイメージ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalImage {
    pub id: String,
    pub os: Option<String>,
    pub architecture: Option<String>,
    pub size: Option<i64>,
}

impl LocalImage {
    /// イメージのメタデータが要求プラットフォームと食い違うか。
    /// メタデータがなければ食い違いとはみなさない
    pub fn mismatches(&self, platform: &Platform) -> bool {
        let os_differs = self.os.as_deref().is_some_and(|os| os != platform.os);
        let arch_differs = self
            .architecture
            .as_deref()
            .is_some_and(|arch| arch != platform.arch);
        os_differs || arch_differs
    }
}

/// デーモンにロードしてリネームまで済んだプラットフォームイメージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformImage {
    pub platform: Platform,
    pub reference: ImageReference,
    pub content: LocalImage,
}

/// レジストリ上のマニフェストのディスクリプタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub manifest: ManifestDescriptor,
    pub platform: Platform,
}

/// マルチアーキテクチャのインデックス。プラットフォームごとに 1 マニフェスト
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiArchIndex {
    entries: Vec<IndexEntry>,
}

impl MultiArchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// エントリを追加する。同じプラットフォームは 1 回まで
    pub fn push(&mut self, entry: IndexEntry) -> Result<()> {
        if self.entries.iter().any(|e| e.platform == entry.platform) {
            return Err(BuildError::InvalidRequest(format!(
                "platform {} already present in index",
                entry.platform
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.entries.iter().map(|e| &e.platform)
    }
}
