use anyhow::{bail, Context, Result};
use reqwest_middleware::ClientBuilder;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{event, Level};

const ETHERSCAN_V2_API: &str = "https://api.etherscan.io/v2/api";
const MAX_RETRIES: u32 = 2;

#[derive(Deserialize, PartialEq, Debug)]
pub struct AbiResponse {
    status: String,
    message: String,
    result: String,
}

#[derive(Deserialize, PartialEq, Debug)]
pub struct SourceCodeResponse {
    status: String,
    message: String,
    result: Vec<SourceCodeEntry>,
}

#[derive(Deserialize, PartialEq, Debug)]
pub struct SourceCodeEntry {
    #[serde(rename = "ABI")]
    pub abi: String,
    #[serde(rename = "ContractName")]
    pub contract_name: String,
    #[serde(rename = "Proxy")]
    pub proxy: String,
    #[serde(rename = "Implementation")]
    pub implementation: String,
}

/// Verified ABI for a contract, with the proxy implementation resolved one
/// level when the explorer reports one.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedAbi {
    pub abi: String,
    pub contract_name: String,
    /// Set when `address` is a proxy and the ABI belongs to the implementation.
    pub implementation: Option<String>,
}

pub async fn fetch_contract_abi(chain_id: u64, address: &str) -> Result<FetchedAbi> {
    let entry = fetch_source_entry(chain_id, address).await?;

    if entry.proxy == "1" && !entry.implementation.is_empty() {
        let implementation = entry.implementation.clone();
        let impl_entry = fetch_source_entry(chain_id, &implementation).await?;
        if impl_entry.abi.starts_with('[') {
            return Ok(FetchedAbi {
                abi: impl_entry.abi,
                contract_name: impl_entry.contract_name,
                implementation: Some(implementation),
            });
        }
        // Implementation not verified, fall back to the proxy ABI
        event!(
            Level::WARN,
            address,
            implementation,
            "proxy implementation source not verified, using proxy ABI"
        );
    }

    if !entry.abi.starts_with('[') {
        bail!("Contract source code not verified for {}", address);
    }

    Ok(FetchedAbi {
        abi: entry.abi,
        contract_name: entry.contract_name,
        implementation: None,
    })
}

async fn fetch_source_entry(chain_id: u64, address: &str) -> Result<SourceCodeEntry> {
    let etherscan_api_key = std::env::var("ETHERSCAN_API_KEY").context("Etherscan key not set")?;

    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
    let http_client = ClientBuilder::new(reqwest::Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();

    let mut retries = 0;
    loop {
        let response = http_client
            .get(format!(
                "{}?chainid={}&module=contract&action=getsourcecode&address={}&apikey={}",
                ETHERSCAN_V2_API, chain_id, address, etherscan_api_key
            ))
            .timeout(Duration::from_secs(15))
            .send()
            .await;

        match response {
            Ok(res) => {
                let contents = res.text().await?;
                let data: SourceCodeResponse = serde_json::from_str(&contents)
                    .context("Failed to deserialize etherscan response")?;

                if data.status != "1" {
                    // "NOTOK" covers both unverified source and bad addresses;
                    // neither is transient, so no retry
                    bail!("Etherscan error for {}: {}", address, data.message);
                }

                let entry = data
                    .result
                    .into_iter()
                    .next()
                    .context("Empty getsourcecode result")?;
                return Ok(entry);
            }
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                let backoff_duration = Duration::from_millis(250 * 2u64.pow(retries));
                sleep(backoff_duration).await;
            }
            Err(e) => {
                event!(
                    Level::ERROR,
                    address,
                    "Failed to fetch contract source after retries"
                );
                return Err(e).context("Etherscan request failed");
            }
        }
    }
}
