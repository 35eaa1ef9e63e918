//! パイプラインのオプション

/// レジストリ接続設定
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// レジストリに平文 HTTP で接続する
    pub insecure: bool,
}

/// 1 回のパイプライン実行で固定のオプション
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// 結果をレジストリへ公開する。マルチプラットフォームでは必須
    pub push: bool,
    /// `nix build` に `--accept-flake-config` を渡す
    pub accept_flake_config: bool,
    pub registry: RegistryOptions,
}

impl BuildOptions {
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn with_accept_flake_config(mut self, accept: bool) -> Self {
        self.accept_flake_config = accept;
        self
    }

    pub fn with_insecure_registry(mut self, insecure: bool) -> Self {
        self.registry.insecure = insecure;
        self
    }
}
