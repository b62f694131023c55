use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::env;
use tracing::info;

pub static CONFIG: OnceCell<RegistryConfig> = OnceCell::new();

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub rpc_url: String,
    pub registry_address: String,
    pub chain_id: u64,
    pub ipfs_upload_endpoint: String,
    pub ipfs_gateway: String,
    pub index_api_url: Option<String>,
    pub snapshot_space: String,
    pub listen_addr: String,
}

impl RegistryConfig {
    pub fn from_env() -> Result<Self> {
        Ok(RegistryConfig {
            rpc_url: env::var("RPC_URL").context("RPC_URL environment variable not set")?,
            registry_address: env::var("REGISTRY_ADDRESS")
                .context("REGISTRY_ADDRESS environment variable not set")?,
            chain_id: env::var("CHAIN_ID")
                .unwrap_or_else(|_| "8453".to_string())
                .parse()
                .context("CHAIN_ID must be a number")?,
            ipfs_upload_endpoint: env::var("IPFS_UPLOAD_ENDPOINT")
                .context("IPFS_UPLOAD_ENDPOINT environment variable not set")?,
            ipfs_gateway: env::var("IPFS_GATEWAY")
                .unwrap_or_else(|_| "https://ipfs.io".to_string()),
            index_api_url: env::var("INDEX_API_URL").ok(),
            snapshot_space: env::var("SNAPSHOT_SPACE").unwrap_or_else(|_| "qidao.eth".to_string()),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        })
    }
}

pub fn load() -> Result<()> {
    let config = RegistryConfig::from_env()?;

    info!(
        chain_id = config.chain_id,
        registry = %config.registry_address,
        "registry config loaded"
    );

    CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Registry config already initialized"))
}

pub fn get() -> &'static RegistryConfig {
    CONFIG.get().expect("config not loaded")
}
