//! 推論サービス
//!
//! モデルが読めなければ縮退モード（予測は500を返す）で、
//! 台帳に接続できなければ台帳なしで起動します。

use anyhow::Context;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tb_records_lib::ledger::{EthLedger, Ledger};
use tb_records_lib::ml::{load_classifier, Classifier};
use tb_records_lib::model::AppConfig;
use tb_records_lib::server::{self, AppState, UploadStore};

#[derive(Parser)]
#[command(about = "Chest X-ray classification web service", version)]
struct Args {
    /// 設定ファイル（JSON）
    #[arg(short, long, env = "TB_RECORDS_CONFIG", default_value = "config.json")]
    config: PathBuf,
    /// 待ち受けアドレスを上書きする
    #[arg(long)]
    listen: Option<String>,
    /// ログを詳しくする（-vv まで）
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tb_records_lib::init_logging(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = AppConfig::load_or_default(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen_address = listen;
    }
    config.validate().context("Invalid configuration")?;
    config.log_summary();

    let uploads = UploadStore::new(&config.uploads.directory);
    uploads.ensure()?;

    let classifier = load_model(&config);
    let ledger = connect_ledger(&config).await;

    let addr = config.listen_address()?;
    let state = Arc::new(AppState::new(classifier, ledger, uploads, config.counter_start));
    let router = server::router(state, config.server.max_upload_bytes);

    server::serve(addr, router, shutdown_signal()).await?;
    tracing::info!("サーバを停止しました");
    Ok(())
}

fn load_model(config: &AppConfig) -> Option<Arc<dyn Classifier>> {
    let path = &config.model.artifact_path;
    if !path.exists() {
        tracing::error!(
            "モデルファイル {} がありません。先に recover_model を実行してください",
            path.display()
        );
        return None;
    }

    match load_classifier(config) {
        Ok(classifier) => {
            tracing::info!(device = %config.device_type, "モデルを読み込みました");
            Some(classifier)
        }
        Err(e) => {
            tracing::error!("モデルの読み込みに失敗しました: {:#}", e);
            None
        }
    }
}

async fn connect_ledger(config: &AppConfig) -> Option<Arc<dyn Ledger>> {
    if !config.ledger.enabled {
        return None;
    }

    match EthLedger::connect(&config.ledger).await {
        Ok(ledger) => Some(Arc::new(ledger)),
        Err(e) => {
            tracing::warn!("台帳を無効にして起動します: {:#}", e);
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("終了シグナルを受け取りました");
}
