//! レジストリの認証情報
//!
//! Docker CLI の設定 (`$DOCKER_CONFIG/config.json` または
//! `~/.docker/config.json`) を読み、レジストリホストごとに認証情報を返す。

use crate::error::{BuildError, Result};
use base64::Engine;
use bollard::auth::DockerCredentials;
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Docker CLI が Docker Hub の認証情報を保存するキー
const DOCKER_HUB_CONFIG_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    /// 認証ヘルパー名 (例: "osxkeychain", "desktop")
    #[serde(default)]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// "username:password" の base64
    #[serde(default)]
    auth: Option<String>,
    /// `auth` がない場合の平文の認証情報
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl AuthEntry {
    fn credential(&self, registry: &str) -> Result<Option<Credential>> {
        if let Some(auth_b64) = self.auth.as_deref().filter(|a| !a.trim().is_empty()) {
            return decode_auth(auth_b64, registry);
        }
        Ok(match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(Credential {
                registry: registry.to_string(),
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret: String,
}

/// レジストリホスト 1 つ分のユーザー名とパスワード
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub registry: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn to_docker(&self) -> DockerCredentials {
        DockerCredentials {
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            serveraddress: Some(self.registry.clone()),
            ..Default::default()
        }
    }

    pub fn to_oci(&self) -> RegistryAuth {
        RegistryAuth::Basic(self.username.clone(), self.password.clone())
    }
}

/// Docker CLI の設定からレジストリの認証情報を解決する
#[derive(Debug, Clone)]
pub struct Keychain {
    config_path: PathBuf,
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

impl Keychain {
    /// `$DOCKER_CONFIG/config.json` を使い、なければ `~/.docker/config.json`
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self { config_path }
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// `registry` (`ghcr.io` や `docker.io` などのホスト) の認証情報
    ///
    /// `Ok(None)` は匿名アクセスを意味する。
    pub async fn resolve(&self, registry: &str) -> Result<Option<Credential>> {
        if !self.config_path.exists() {
            tracing::debug!("Docker config not found at {:?}", self.config_path);
            return Ok(None);
        }

        let config = self.load_config()?;

        for key in config_keys(registry) {
            if let Some(entry) = config.auths.get(key)
                && let Some(credential) = entry.credential(registry)?
            {
                tracing::debug!("Found credentials in auths for {}", registry);
                return Ok(Some(credential));
            }
        }

        if let Some(helper) = &config.creds_store {
            tracing::debug!("Trying credential helper: {}", helper);
            for key in config_keys(registry) {
                match self.query_helper(helper, key, registry).await {
                    Ok(Some(credential)) => return Ok(Some(credential)),
                    Ok(None) => {}
                    Err(e) => tracing::debug!("{}", e),
                }
            }
        }

        tracing::debug!("No credentials found for {}", registry);
        Ok(None)
    }

    /// Docker Engine API 向けの形式の認証情報
    pub async fn docker_credentials(&self, registry: &str) -> Result<Option<DockerCredentials>> {
        Ok(self.resolve(registry).await?.map(|c| c.to_docker()))
    }

    /// レジストリクライアント向けの形式の認証情報
    pub async fn registry_auth(&self, registry: &str) -> Result<RegistryAuth> {
        Ok(self
            .resolve(registry)
            .await?
            .map(|c| c.to_oci())
            .unwrap_or(RegistryAuth::Anonymous))
    }

    fn load_config(&self) -> Result<DockerConfig> {
        let content =
            std::fs::read_to_string(&self.config_path).map_err(|e| BuildError::AuthFailed {
                registry: self.config_path.display().to_string(),
                message: format!("Failed to read config.json: {}", e),
            })?;

        serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
            registry: self.config_path.display().to_string(),
            message: format!("Failed to parse config.json: {}", e),
        })
    }

    async fn query_helper(
        &self,
        helper: &str,
        server: &str,
        registry: &str,
    ) -> Result<Option<Credential>> {
        let helper_cmd = format!("docker-credential-{}", helper);
        let failed = |message: String| BuildError::AuthFailed {
            registry: registry.to_string(),
            message,
        };

        let mut child = Command::new(&helper_cmd)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("Failed to run {}: {}", helper_cmd, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(server.as_bytes())
                .await
                .map_err(|e| failed(format!("Failed to write to {}: {}", helper_cmd, e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failed(format!("Credential helper failed: {}", e)))?;

        if !output.status.success() {
            tracing::debug!(
                "Credential helper has no entry for {}: {}",
                server,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        let response: HelperResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| failed(format!("Failed to parse credential helper response: {}", e)))?;

        Ok(Some(Credential {
            registry: registry.to_string(),
            username: response.username,
            password: response.secret,
        }))
    }
}

/// レジストリホストに対して参照する設定キー
fn config_keys(registry: &str) -> Vec<&str> {
    if registry == "docker.io" || registry == "index.docker.io" {
        vec![registry, DOCKER_HUB_CONFIG_KEY]
    } else {
        vec![registry]
    }
}

fn decode_auth(auth_b64: &str, registry: &str) -> Result<Option<Credential>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64.trim())
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to decode auth: {}", e),
        })?;

    let auth_str = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
        registry: registry.to_string(),
        message: format!("Invalid UTF-8 in auth: {}", e),
    })?;

    Ok(auth_str
        .split_once(':')
        .map(|(username, password)| Credential {
            registry: registry.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }))
}
