use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path};

/// Deployment artifact as written by the deploy scripts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub entry_point: String,
    pub factory: String,
    #[serde(default)]
    pub paymaster: Option<String>,
    #[serde(default)]
    pub beneficiary: Option<String>,
}

/// Addresses the pipeline talks to. Injected into every component; nothing in
/// the library hard-codes a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub entry_point: Address,
    pub factory: Address,
    pub paymaster: Option<Address>,
    pub beneficiary: Option<Address>,
}

impl DeploymentConfig {
    pub fn new(chain_id: u64, entry_point: Address, factory: Address) -> Self {
        Self {
            chain_id,
            rpc_url: String::new(),
            entry_point,
            factory,
            paymaster: None,
            beneficiary: None,
        }
    }
}

pub fn load_deployment(path: &Path, rpc_override: Option<String>) -> Result<DeploymentConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read deployment json at {}", path.display()))?;
    parse_deployment(&raw, rpc_override)
        .with_context(|| format!("failed to parse deployment json at {}", path.display()))
}

pub fn parse_deployment(json: &str, rpc_override: Option<String>) -> Result<DeploymentConfig> {
    let raw: DeploymentRaw = serde_json::from_str(json)?;

    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.clone() {
        env::var(&env_var).unwrap_or(raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    let entry_point = parse_addr(&raw.entry_point).context("invalid entryPoint address")?;
    let factory = parse_addr(&raw.factory).context("invalid factory address")?;
    let paymaster = raw
        .paymaster
        .as_deref()
        .map(parse_addr)
        .transpose()
        .context("invalid paymaster address")?;
    let beneficiary = raw
        .beneficiary
        .as_deref()
        .map(parse_addr)
        .transpose()
        .context("invalid beneficiary address")?;

    if entry_point == factory {
        return Err(anyhow!("entryPoint and factory must be different contracts"));
    }

    Ok(DeploymentConfig {
        chain_id: raw.chain_id,
        rpc_url,
        entry_point,
        factory,
        paymaster,
        beneficiary,
    })
}

pub fn parse_addr(s: &str) -> Result<Address> {
    s.trim()
        .parse::<Address>()
        .map_err(|e| anyhow!("{e}"))
}
