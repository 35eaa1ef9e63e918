//! パイプラインテスト用のインメモリのデーモン/レジストリと、スクリプトによる nix の代役

#![cfg(unix)]
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use nixcontainers_build::{
    BuildError, ImageDaemon, ImageReference, LocalImage, ManifestDescriptor, MultiArchIndex,
    Platform, Registry, Result,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// デーモンの代役。アーカイブは `<label> <os> <arch>` というテキストで、
/// ロードすると `<label>` でイメージを登録する。
///
/// 名前は Docker と同じく短縮形で保持するので、`docker.io/myuser/app` と
/// `myuser/app` は同じイメージを指す。
#[derive(Default)]
pub struct FakeDaemon {
    images: Mutex<HashMap<String, LocalImage>>,
    events: Mutex<Vec<String>>,
    clobbered: AtomicBool,
    reject_loads: bool,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// すべてのロードにエラーレコードで応答する
    pub fn rejecting() -> Self {
        Self {
            reject_loads: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.images
            .lock()
            .unwrap()
            .contains_key(&image_key_str(reference))
    }

    /// ロード名のまま残っていたイメージを別のロードが上書きしたか
    pub fn clobbered(&self) -> bool {
        self.clobbered.load(Ordering::SeqCst)
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ImageDaemon for FakeDaemon {
    async fn load_image(
        &self,
        archive: BoxStream<'static, Bytes>,
    ) -> Result<BoxStream<'static, io::Result<Bytes>>> {
        let chunks: Vec<Bytes> = archive.collect().await;
        let text = String::from_utf8_lossy(&chunks.concat()).trim().to_string();

        if self.reject_loads {
            let line = "{\"errorDetail\":{\"message\":\"invalid tar header\"},\"error\":\"invalid tar header\"}\n";
            return Ok(futures_util::stream::iter(vec![Ok(Bytes::from(line))]).boxed());
        }

        let mut parts = text.split_whitespace();
        let label = parts.next().unwrap_or("unnamed:latest").to_string();
        let key = image_key_str(&label);
        let os = parts.next().map(str::to_string);
        let architecture = parts.next().map(str::to_string);

        {
            let mut images = self.images.lock().unwrap();
            if images.contains_key(&key) {
                self.clobbered.store(true, Ordering::SeqCst);
            }
            images.insert(
                key,
                LocalImage {
                    id: format!("sha256:{}", architecture.clone().unwrap_or_default()),
                    os,
                    architecture,
                    size: Some(text.len() as i64),
                },
            );
        }
        self.record(format!("load {}", label));

        let lines = vec![
            "{\"status\":\"Loading layer\",\"id\":\"a\",\"progress\":\"1/1\"}\n".to_string(),
            format!("{{\"stream\":\"Loaded image: {}\\n\"}}\n", label),
        ];
        Ok(futures_util::stream::iter(lines.into_iter().map(|l| Ok(Bytes::from(l)))).boxed())
    }

    async fn tag_image(&self, source: &ImageReference, target: &ImageReference) -> Result<()> {
        let mut images = self.images.lock().unwrap();
        let image = images
            .get(&image_key(source))
            .cloned()
            .ok_or_else(|| BuildError::InvalidRequest(format!("no such image: {}", source)))?;
        images.insert(image_key(target), image);
        drop(images);
        self.record(format!("tag {} {}", source, target));
        Ok(())
    }

    async fn remove_image(&self, reference: &ImageReference) -> Result<()> {
        self.images.lock().unwrap().remove(&image_key(reference));
        self.record(format!("remove {}", reference));
        Ok(())
    }

    async fn inspect_image(&self, reference: &ImageReference) -> Result<LocalImage> {
        self.images
            .lock()
            .unwrap()
            .get(&image_key(reference))
            .cloned()
            .ok_or_else(|| BuildError::InvalidRequest(format!("no such image: {}", reference)))
    }
}

/// デーモン上の名前 (短縮名:タグ)
fn image_key(reference: &ImageReference) -> String {
    format!("{}:{}", reference.familiar_name(), reference.tag_or_default())
}

fn image_key_str(reference: &str) -> String {
    ImageReference::parse(reference)
        .map(|r| image_key(&r))
        .unwrap_or_else(|_| reference.to_string())
}

/// プッシュを記録するレジストリの代役
#[derive(Default)]
pub struct FakeRegistry {
    pushed: Mutex<Vec<String>>,
    indexes: Mutex<Vec<(String, MultiArchIndex)>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn indexes(&self) -> Vec<(String, MultiArchIndex)> {
        self.indexes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn push_image(&self, reference: &ImageReference, _image: &LocalImage) -> Result<()> {
        self.pushed.lock().unwrap().push(reference.to_string());
        Ok(())
    }

    async fn manifest_descriptor(
        &self,
        reference: &ImageReference,
        _platform: &Platform,
    ) -> Result<ManifestDescriptor> {
        if !self.pushed.lock().unwrap().contains(&reference.to_string()) {
            return Err(BuildError::Registry {
                reference: reference.to_string(),
                message: "manifest unknown".to_string(),
            });
        }
        Ok(ManifestDescriptor {
            media_type: DOCKER_MANIFEST.to_string(),
            digest: format!("sha256:{}", reference.tag_or_default()),
            size: 528,
        })
    }

    async fn push_index(
        &self,
        reference: &ImageReference,
        index: &MultiArchIndex,
    ) -> Result<String> {
        self.indexes
            .lock()
            .unwrap()
            .push((reference.to_string(), index.clone()));
        Ok("sha256:index".to_string())
    }
}

/// `nix` の代役スクリプトの振る舞い
#[derive(Debug, Clone, Default)]
pub struct NixScript {
    /// 各プロデューサーがイメージをロードする名前
    pub label: Option<String>,
    /// 1秒後に exit 1 で失敗する nix system
    pub fail_system: Option<&'static str>,
    /// ビルドに `slow_secs` 秒かかる nix system
    pub slow_system: Option<&'static str>,
    pub slow_secs: u32,
    /// pid を記録して終わらなくなる nix system
    pub hang_system: Option<&'static str>,
}

/// `nix` の代役とアーキテクチャごとのイメージストリームプロデューサー
pub struct NixFixture {
    pub dir: TempDir,
    pub nix: PathBuf,
    invocations: PathBuf,
    pids: PathBuf,
}

impl NixFixture {
    pub fn new(script: NixScript) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let invocations = dir.path().join("invocations");
        let pids = dir.path().join("pids");
        let label = script.label.unwrap_or_else(|| "app:nix-built".to_string());

        for arch in ["amd64", "arm64"] {
            write_script(
                dir.path(),
                &format!("producer-{}", arch),
                &format!(
                    "echo 'writing layers' >&2\nprintf '%s linux %s\\n' '{}' '{}'",
                    label, arch
                ),
            );
        }

        let mut cases = String::new();
        if let Some(system) = script.hang_system {
            cases.push_str(&format!(
                "case \"$last\" in *{}*) echo $$ >> '{}'; exec sleep 30 ;; esac\n",
                system,
                pids.display()
            ));
        }
        if let Some(system) = script.fail_system {
            cases.push_str(&format!(
                "case \"$last\" in *{}*) sleep 1; echo 'error: build failed' >&2; exit 1 ;; esac\n",
                system
            ));
        }
        if let Some(system) = script.slow_system {
            cases.push_str(&format!(
                "case \"$last\" in *{}*) sleep {} ;; esac\n",
                system, script.slow_secs
            ));
        }

        let body = format!(
            "for last; do :; done\n\
             echo \"$*\" >> '{invocations}'\n\
             {cases}\
             case \"$last\" in\n\
               *aarch64-linux*) arch=arm64 ;;\n\
               *) arch=amd64 ;;\n\
             esac\n\
             printf '[{{\"drvPath\":\"/nix/store/x.drv\",\"outputs\":{{\"out\":\"%s\"}}}}]' '{dir}/producer-'\"$arch\"",
            invocations = invocations.display(),
            cases = cases,
            dir = dir.path().display(),
        );
        let nix = write_script(dir.path(), "nix", &body);

        Self {
            dir,
            nix,
            invocations,
            pids,
        }
    }

    /// `nix` の呼び出し引数 (呼ばれた順)
    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(&self.invocations)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// 終わらなくなった `nix` の pid が `count` 個そろうまで待つ
    pub async fn wait_for_hung_builds(&self, count: usize) -> Vec<u32> {
        for _ in 0..100 {
            let pids: Vec<u32> = std::fs::read_to_string(&self.pids)
                .map(|s| s.lines().filter_map(|l| l.trim().parse().ok()).collect())
                .unwrap_or_default();
            if pids.len() >= count {
                return pids;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("{} hung builds never started", count);
    }
}

/// `pid` のプロセスが動いているか。ゾンビは終了済みとみなす
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
        .map(|out| {
            let stat = String::from_utf8_lossy(&out.stdout).trim().to_string();
            out.status.success() && !stat.is_empty() && !stat.starts_with('Z')
        })
        .unwrap_or(false)
}

/// `pid` が終了するまで最大5秒待ち、終了したかを返す
pub async fn wait_for_exit(pid: u32) -> bool {
    for _ in 0..50 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
