//! ストリーミングローダー
//!
//! イメージストリーム生成スクリプトの stdout をそのままデーモンに流し込み、
//! デーモンの進捗出力からロードされたイメージ参照を取り出す。

use crate::daemon::ImageDaemon;
use crate::error::{BuildError, Result};
use crate::model::ImageReference;
use crate::process::drain_diagnostics;
use futures_util::StreamExt;
use serde::Deserialize;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::Command;
use tokio_util::io::{ReaderStream, StreamReader};

const LOADED_IMAGE_PREFIXES: [&str; 2] = ["Loaded image: ", "Loaded image ID: "];

/// デーモンの `/images/load` 進捗出力の 1 行
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressRecord {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// ロードされたイメージ名が現れるまで進捗レコードを読む
///
/// 参照が見つかった時点で返り、残りのストリームは読まない。
pub async fn read_loaded_reference<R>(reader: R) -> Result<ImageReference>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| BuildError::Protocol(format!("failed to read load progress: {}", e)))?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| BuildError::Protocol(format!("invalid progress record {:?}: {}", line, e)))?;
        if !value.is_object() {
            return Err(BuildError::Protocol(format!(
                "progress record is not an object: {}",
                line
            )));
        }
        let record: ProgressRecord = serde_json::from_value(value)
            .map_err(|e| BuildError::Protocol(format!("invalid progress record {:?}: {}", line, e)))?;

        if record.error.is_some() || record.error_detail.is_some() {
            let message = record
                .error_detail
                .and_then(|d| d.message)
                .or(record.error)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(BuildError::LoadRejected(message));
        }

        if let Some(stream) = &record.stream {
            let text = stream.trim();
            if let Some(loaded) = LOADED_IMAGE_PREFIXES
                .iter()
                .find_map(|prefix| text.strip_prefix(prefix))
            {
                return ImageReference::parse(loaded.trim()).map_err(|e| {
                    BuildError::Protocol(format!("daemon reported an unusable reference: {}", e))
                });
            }
            if !text.is_empty() {
                tracing::debug!(source = "daemon", "{}", text);
            }
            continue;
        }

        if let Some(status) = &record.status {
            tracing::debug!(source = "daemon", "{}", status);
            continue;
        }

        return Err(BuildError::Protocol(format!(
            "unrecognized progress record: {}",
            line
        )));
    }

    Err(BuildError::NoLoadedRef)
}

/// `producer` を実行し、その stdout を `daemon` へストリームする
///
/// ロード失敗時や future が drop されたときは producer を kill する。
/// ロードが成功しても終了ステータスは確認する。
pub async fn load_stream<D>(daemon: &D, producer: &Path) -> Result<ImageReference>
where
    D: ImageDaemon + ?Sized,
{
    let program = producer.display().to_string();
    tracing::debug!(cmd = %program, "running image stream producer");

    let mut child = Command::new(producer)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BuildError::Spawn {
            program: program.clone(),
            source,
        })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(BuildError::Pipe {
            program,
            source: io::Error::other("stdio not captured"),
        });
    };

    // デーモンクライアントには素のバイト列を渡す。読み込みエラーはストリームを
    // 終わらせ、後でまとめて報告する
    let read_error: Arc<Mutex<Option<io::Error>>> = Arc::default();
    let archive = {
        let read_error = Arc::clone(&read_error);
        ReaderStream::new(stdout)
            .scan((), move |_, chunk| {
                let item = match chunk {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        if let Ok(mut slot) = read_error.lock() {
                            *slot = Some(e);
                        }
                        None
                    }
                };
                futures_util::future::ready(item)
            })
            .boxed()
    };

    let mut killed = false;
    let (drained, loaded) = tokio::join!(drain_diagnostics(stderr, &program), async {
        let loaded = async {
            let progress = daemon.load_image(archive).await?;
            read_loaded_reference(StreamReader::new(progress)).await
        }
        .await;
        if loaded.is_err() {
            // stderr の読み出しを止めるため
            killed = child.start_kill().is_ok();
        }
        loaded
    });

    let status = child.wait().await.map_err(|source| BuildError::Pipe {
        program: program.clone(),
        source,
    })?;

    let mut errors = Vec::new();
    let reference = match loaded {
        Ok(reference) => Some(reference),
        Err(e) => {
            errors.push(e);
            None
        }
    };
    if let Ok(mut slot) = read_error.lock()
        && let Some(source) = slot.take()
    {
        errors.push(BuildError::Pipe {
            program: program.clone(),
            source,
        });
    }
    if let Err(source) = drained {
        errors.push(BuildError::Diagnostics {
            program: program.clone(),
            source,
        });
    }
    // 自分で kill した後のシグナル終了は producer の失敗ではない
    if !status.success() && !(killed && status.code().is_none()) {
        errors.push(BuildError::ProducerFailed {
            path: producer.to_path_buf(),
            status,
        });
    }

    match (reference, BuildError::join(errors)) {
        (_, Some(err)) => Err(err),
        (Some(reference), None) => {
            tracing::debug!(%reference, "image loaded");
            Ok(reference)
        }
        (None, None) => Err(BuildError::NoLoadedRef),
    }
}
