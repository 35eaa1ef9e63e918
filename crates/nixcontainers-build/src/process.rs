//! ビルダーとローダーで共有するサブプロセス処理

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// 子プロセスの診断出力を EOF まで 1 行ずつログへ転送する
///
/// 不正な UTF-8 は置換して読む。診断出力の内容でエラー判定はしない。
pub(crate) async fn drain_diagnostics<R>(reader: R, source: &str) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if !line.is_empty() {
            tracing::debug!(source, "{}", line);
        }
    }
}
