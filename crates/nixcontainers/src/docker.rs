use colored::Colorize;

/// ローカルの Docker デーモンに接続し、応答するか確認する
pub async fn connect() -> anyhow::Result<bollard::Docker> {
    let docker = bollard::Docker::connect_with_local_defaults().map_err(connection_failed)?;
    docker.ping().await.map_err(connection_failed)?;
    tracing::debug!("connected to Docker daemon");
    Ok(docker)
}

fn connection_failed(e: bollard::errors::Error) -> anyhow::Error {
    eprintln!();
    eprintln!("{}", "✗ Docker接続エラー".red().bold());
    eprintln!();
    eprintln!("{}", "原因:".yellow());
    eprintln!("  {}", e);
    eprintln!();
    eprintln!("{}", "解決方法:".yellow());
    eprintln!("  • Dockerデーモンが起動しているか確認してください");
    eprintln!("  • デフォルト以外のソケットを使う場合は DOCKER_HOST を確認してください");
    eprintln!("  • docker ps コマンドが正常に動作するか確認してください");
    anyhow::anyhow!("Docker接続に失敗しました")
}
