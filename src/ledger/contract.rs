//! コントラクトのビルド成果物（Truffle形式のJSON）の読み込み

use anyhow::{bail, Context, Result};
use ethers::abi::{Abi, ParamType};
use ethers::types::Address;
use serde::Deserialize;
use std::path::Path;

/// 記録に使う関数名
pub const ADD_RECORD: &str = "addRecord";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildArtifact {
    #[serde(default)]
    contract_name: Option<String>,
    abi: Abi,
    #[serde(default)]
    networks: serde_json::Map<String, serde_json::Value>,
}

/// デプロイ済みコントラクトの情報
#[derive(Debug, Clone, PartialEq)]
pub struct ContractDescriptor {
    pub contract_name: Option<String>,
    /// ファイル内で最初に現れるネットワークID
    pub network_id: String,
    pub address: Address,
}

impl ContractDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read contract artifact: {}", path.display()))?;
        Self::from_json_str(&json)
            .with_context(|| format!("Invalid contract artifact: {}", path.display()))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let artifact: BuildArtifact =
            serde_json::from_str(json).context("Failed to parse contract artifact JSON")?;

        let function = artifact
            .abi
            .function(ADD_RECORD)
            .with_context(|| format!("ABI has no {} function", ADD_RECORD))?;
        let inputs: Vec<&ParamType> = function.inputs.iter().map(|p| &p.kind).collect();
        if inputs != [&ParamType::String, &ParamType::String] {
            bail!("{} must take (string, string), found {:?}", ADD_RECORD, inputs);
        }

        // networks はファイル上の順序を保持している（preserve_order）
        let Some((network_id, network)) = artifact.networks.iter().next() else {
            bail!("contract has not been deployed to any network");
        };
        let address = network
            .get("address")
            .and_then(|v| v.as_str())
            .with_context(|| format!("network {} has no address", network_id))?
            .parse::<Address>()
            .with_context(|| format!("network {} has an invalid address", network_id))?;

        Ok(Self {
            contract_name: artifact.contract_name,
            network_id: network_id.clone(),
            address,
        })
    }
}
