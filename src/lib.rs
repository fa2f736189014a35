//! 胸部X線画像の分類サービスと、その結果を台帳に記録する仕組み

pub mod error;
pub mod ledger;
pub mod ml;
pub mod model;
pub mod server;
pub mod types;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// ログ出力を初期化する（`RUST_LOG` が指定されていればそちらを優先）
pub fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();
}
