//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデルのパス、HTTPサーバ、アップロード先、台帳接続をJSON形式で保存・読み込みします。
//! ファイルに無い項目はデフォルト値で補われます。

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
    /// WGPU (GPU) バックエンド（`wgpu` フィーチャが必要）
    Wgpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// 推論サービスが読み込むアーティファクト（recover_model の出力）
    pub artifact_path: PathBuf,
    /// recover_model が取り込む重みファイル
    pub weights_path: PathBuf,
    /// トポロジJSON（未指定なら組み込みのもの）
    pub topology_path: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("full_model.tar.gz"),
            weights_path: PathBuf::from("model_4.safetensors"),
            topology_path: None,
        }
    }
}

/// HTTPサーバ設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_address: String,
    /// アップロード1件あたりの最大バイト数
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:5000".to_string(),
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// アップロード保存先
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadSettings {
    pub directory: PathBuf,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("static/uploads"),
        }
    }
}

/// 台帳（Ethereum互換ノード）接続設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerSettings {
    pub enabled: bool,
    pub rpc_url: String,
    /// Truffle のビルド成果物（abi と networks を含むJSON）
    pub contract_path: PathBuf,
    /// 送信元アカウント（未指定ならノードの先頭アカウント）
    pub from_account: Option<String>,
    pub gas_limit: u64,
    /// レシート待ちのポーリング間隔
    pub poll_interval_ms: u64,
    /// レシート待ちの上限（None なら無制限）
    pub receipt_timeout_secs: Option<u64>,
    /// EIP-1559 ではなくレガシートランザクションを送る
    pub legacy_transactions: bool,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            contract_path: PathBuf::from("build/contracts/TBRecords.json"),
            from_account: None,
            gas_limit: 500_000,
            poll_interval_ms: 500,
            receipt_timeout_secs: Some(120),
            legacy_transactions: true,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub model: ModelSettings,
    pub server: ServerSettings,
    pub uploads: UploadSettings,
    pub ledger: LedgerSettings,
    /// 予測カウンタの初期値
    pub counter_start: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            model: ModelSettings::default(),
            server: ServerSettings::default(),
            uploads: UploadSettings::default(),
            ledger: LedgerSettings::default(),
            counter_start: 1000,
        }
    }
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// 設定を読み込む。ファイルが存在しない場合はデフォルト設定を返す
    ///
    /// 壊れたファイルはエラーになります。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path)?;
            tracing::info!("設定ファイルを読み込みました: {}", path.display());
            Ok(config)
        } else {
            tracing::info!(
                "設定ファイルが存在しません ({})。デフォルト設定を使用します",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 待ち受けアドレス
    pub fn listen_address(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_address))
    }

    /// 起動前の検証。失敗は致命的
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_address()?;

        if self.server.max_upload_bytes == 0 {
            bail!("server.max_upload_bytes must be greater than zero");
        }
        if self.uploads.directory.as_os_str().is_empty() {
            bail!("uploads.directory must not be empty");
        }
        if self.model.artifact_path.as_os_str().is_empty() {
            bail!("model.artifact_path must not be empty");
        }

        if self.ledger.enabled {
            url::Url::parse(&self.ledger.rpc_url)
                .with_context(|| format!("Invalid ledger.rpc_url: {}", self.ledger.rpc_url))?;
            if self.ledger.gas_limit == 0 {
                bail!("ledger.gas_limit must be greater than zero");
            }
            if self.ledger.poll_interval_ms == 0 {
                bail!("ledger.poll_interval_ms must be greater than zero");
            }
            if self.ledger.receipt_timeout_secs == Some(0) {
                bail!("ledger.receipt_timeout_secs must be greater than zero when set");
            }
            if let Some(account) = &self.ledger.from_account {
                account
                    .parse::<ethers::types::Address>()
                    .with_context(|| format!("Invalid ledger.from_account: {}", account))?;
            }
        }

        Ok(())
    }

    /// 設定情報をログに出す
    pub fn log_summary(&self) {
        tracing::info!(
            device = %self.device_type,
            artifact = %self.model.artifact_path.display(),
            listen = %self.server.listen_address,
            uploads = %self.uploads.directory.display(),
            "アプリケーション設定"
        );
        if self.ledger.enabled {
            tracing::info!(
                rpc_url = %self.ledger.rpc_url,
                contract = %self.ledger.contract_path.display(),
                gas_limit = self.ledger.gas_limit,
                "台帳設定"
            );
        } else {
            tracing::info!("台帳は設定で無効化されています");
        }
    }
}
