//! 外部で学習された重みからモデルアーティファクトを組み立てる

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;

use tb_records_lib::ml::{reconstruct_model, Topology};
use tb_records_lib::model::AppConfig;

#[derive(Parser)]
#[command(about = "Rebuild the classifier network and attach trained weights", version)]
struct Args {
    /// 設定ファイル（JSON）。指定の無い引数はここの `model` から取る
    #[arg(short, long, env = "TB_RECORDS_CONFIG", default_value = "config.json")]
    config: PathBuf,
    /// 重みファイル（safetensors）
    #[arg(short, long)]
    weights: Option<PathBuf>,
    /// 出力先（`.gz` で終わらなければ `.tar.gz` を付ける）
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// トポロジJSON（省略時は組み込み）
    #[arg(short, long)]
    topology: Option<PathBuf>,
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tb_records_lib::init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(&args.config)?;
    let weights = args.weights.unwrap_or(config.model.weights_path);
    let output = args.output.unwrap_or(config.model.artifact_path);
    let topology_path = args.topology.or(config.model.topology_path);

    let topology = Topology::load_or_builtin(topology_path.as_deref())?;
    tracing::info!(
        topology = %topology.name,
        weights = %weights.display(),
        output = %output.display(),
        "モデルを組み立てます"
    );

    let outcome = reconstruct_model(&weights, &topology, &output)?;
    tracing::info!(
        artifact = %outcome.artifact_path.display(),
        num_params = outcome.num_params,
        "完了しました"
    );
    Ok(())
}
