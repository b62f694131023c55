use alloy::{network::EthereumWallet, providers::ProviderBuilder, signers::local::PrivateKeySigner};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use dotenv::dotenv;
use registry::abi::{parse_abi, ParsedFunction};
use registry::cache::ProposalCache;
use registry::config;
use registry::content::ProposalContent;
use registry::index_api::IndexNotifier;
use registry::ipfs::IpfsClient;
use registry::registry::{
    explorer_tx_url, OnchainRegistry, ProposalRegistry, RegistryRecord, RevertReason,
};
use registry::content::ProposalStatus;
use registry::snapshot::{SnapshotClient, SnapshotSubmission};
use registry::sync::{ProposalSynchronizer, Settlement, StageReporter, SyncError, WriteOutcome};
use scanners::etherscan::fetch_contract_abi;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use utils::tracing::run_with_tracing;

#[derive(Clone)]
struct AppState {
    sync: Arc<ProposalSynchronizer>,
    snapshot: Arc<SnapshotClient>,
    chain_id: u64,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    run_with_tracing(|| async { run().await }).await;
}

async fn run() -> Result<()> {
    config::load()?;
    let config = config::get();

    let registry_address = config
        .registry_address
        .parse()
        .context("REGISTRY_ADDRESS is not a valid address")?;
    let rpc_url = config.rpc_url.parse().context("RPC_URL is not a valid url")?;

    let onchain: Arc<dyn ProposalRegistry> = match std::env::var("REGISTRY_PRIVATE_KEY") {
        Ok(key) => {
            let signer: PrivateKeySigner = key.parse().context("invalid REGISTRY_PRIVATE_KEY")?;
            let provider = ProviderBuilder::new()
                .wallet(EthereumWallet::from(signer))
                .connect_http(rpc_url);
            Arc::new(OnchainRegistry::new(registry_address, provider))
        }
        Err(_) => {
            warn!("REGISTRY_PRIVATE_KEY not set, running read-only");
            let provider = ProviderBuilder::new().connect_http(rpc_url);
            Arc::new(OnchainRegistry::new(registry_address, provider))
        }
    };

    let store = Arc::new(IpfsClient::new(
        config.ipfs_upload_endpoint.clone(),
        config.ipfs_gateway.clone(),
    ));
    let notifier = config
        .index_api_url
        .clone()
        .map(|url| Arc::new(IndexNotifier::new(url)));
    let cache = Arc::new(ProposalCache::new());

    // Periodic sweep of expired cache entries
    let gc_cache = Arc::clone(&cache);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let collected = gc_cache.gc();
            if collected > 0 {
                info!(collected, "cache gc swept expired entries");
            }
        }
    });

    let sync = Arc::new(ProposalSynchronizer::new(
        onchain,
        store,
        notifier,
        cache,
        Some(registry_address),
    ));

    let state = AppState {
        sync,
        snapshot: Arc::new(SnapshotClient::new()),
        chain_id: config.chain_id,
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/proposals", get(list_proposals).post(create_proposal))
        .route("/proposals/{qci}", get(get_proposal).put(update_proposal))
        .route("/proposals/{qci}/status", post(set_status))
        .route("/proposals/{qci}/snapshot", post(link_snapshot))
        .route("/abi/{chain_id}/{address}", get(fetch_abi))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("Failed to bind listen address")?;
    info!(addr = %config.listen_addr, "registry API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")?;

    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct ProposalResponse {
    record: RegistryRecord,
    content: ProposalContent,
}

#[derive(Serialize)]
struct WriteResponse {
    qci: u64,
    tx_hash: String,
    explorer_url: String,
    cid: Option<String>,
    settlement: &'static str,
    integrity_warning: Option<String>,
}

impl WriteResponse {
    fn from_outcome(outcome: WriteOutcome, chain_id: u64) -> Self {
        let (settlement, integrity_warning) = describe_settlement(&outcome.settlement);
        Self {
            qci: outcome.qci,
            tx_hash: outcome.tx_hash.to_string(),
            explorer_url: explorer_tx_url(chain_id, outcome.tx_hash),
            cid: Some(outcome.cid),
            settlement,
            integrity_warning,
        }
    }
}

fn describe_settlement(settlement: &Settlement) -> (&'static str, Option<String>) {
    match settlement {
        Settlement::Settled => ("settled", None),
        Settlement::WarnSettled(warning) => (
            "settled_with_warning",
            Some(format!(
                "stored identifier {} differs from pre-computed {}",
                warning.stored_cid, warning.expected_cid
            )),
        ),
        Settlement::Unverified => (
            "unverified",
            Some("confirmation timed out; the write may have succeeded, verify manually".to_string()),
        ),
    }
}

fn error_response(e: SyncError) -> (StatusCode, String) {
    match e {
        SyncError::Validation(m) => (StatusCode::BAD_REQUEST, m),
        // User cancelled; nothing alarming to report
        SyncError::SignerRejected => (StatusCode::CONFLICT, e.to_string()),
        SyncError::Revert(RevertReason::UnknownProposal) => {
            (StatusCode::NOT_FOUND, e.to_string())
        }
        SyncError::Revert(_) => (StatusCode::CONFLICT, e.to_string()),
        SyncError::Network(_) | SyncError::Integrity(_) => {
            (StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

async fn get_proposal(
    State(state): State<AppState>,
    Path(qci): Path<u64>,
) -> Result<Json<ProposalResponse>, (StatusCode, String)> {
    match state.sync.get_proposal(qci).await {
        Ok((record, content)) => Ok(Json(ProposalResponse { record, content })),
        Err(SyncError::Revert(RevertReason::UnknownProposal)) => {
            Err((StatusCode::NOT_FOUND, format!("QCI {qci} does not exist")))
        }
        Err(e) => Err(error_response(e)),
    }
}

async fn list_proposals(
    State(state): State<AppState>,
) -> Result<Json<Vec<RegistryRecord>>, (StatusCode, String)> {
    state
        .sync
        .list_proposals()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn create_proposal(
    State(state): State<AppState>,
    Json(content): Json<ProposalContent>,
) -> Result<Json<WriteResponse>, (StatusCode, String)> {
    let outcome = state
        .sync
        .create(&content, StageReporter::disabled())
        .await
        .map_err(error_response)?;
    Ok(Json(WriteResponse::from_outcome(outcome, state.chain_id)))
}

#[derive(Deserialize)]
struct UpdateRequest {
    content: ProposalContent,
    #[serde(default)]
    change_note: String,
}

async fn update_proposal(
    State(state): State<AppState>,
    Path(qci): Path<u64>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<WriteResponse>, (StatusCode, String)> {
    let mut content = request.content;
    content.qci = qci;
    let outcome = state
        .sync
        .update(&content, &request.change_note, StageReporter::disabled())
        .await
        .map_err(error_response)?;
    Ok(Json(WriteResponse::from_outcome(outcome, state.chain_id)))
}

#[derive(Deserialize)]
struct StatusRequest {
    status: ProposalStatus,
}

async fn set_status(
    State(state): State<AppState>,
    Path(qci): Path<u64>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<WriteResponse>, (StatusCode, String)> {
    let outcome = state
        .sync
        .set_status(qci, request.status, StageReporter::disabled())
        .await
        .map_err(error_response)?;
    let (settlement, integrity_warning) = describe_settlement(&outcome.settlement);
    Ok(Json(WriteResponse {
        qci: outcome.qci,
        tx_hash: outcome.tx_hash.to_string(),
        explorer_url: explorer_tx_url(state.chain_id, outcome.tx_hash),
        cid: None,
        settlement,
        integrity_warning,
    }))
}

const VOTING_WINDOW_SECS: i64 = 3 * 24 * 60 * 60;

#[derive(Deserialize)]
struct LinkSnapshotRequest {
    /// When absent, a new hub proposal is submitted from the stored
    /// content and its id is linked.
    snapshot_id: Option<String>,
    #[serde(default)]
    discussion: String,
}

async fn link_snapshot(
    State(state): State<AppState>,
    Path(qci): Path<u64>,
    Json(request): Json<LinkSnapshotRequest>,
) -> Result<Json<WriteResponse>, (StatusCode, String)> {
    let snapshot_id = match request.snapshot_id {
        Some(id) => {
            let known = state
                .snapshot
                .get_proposal(&id)
                .await
                .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
            if known.is_none() {
                return Err((
                    StatusCode::BAD_REQUEST,
                    format!("snapshot proposal {id} is unknown to the hub"),
                ));
            }
            id
        }
        None => {
            let (_, content) = state.sync.get_proposal(qci).await.map_err(error_response)?;
            let now = Utc::now().timestamp();
            let submission = SnapshotSubmission {
                space: config::get().snapshot_space.clone(),
                title: format!("QCI{qci}: {}", content.title),
                body: content.body.clone(),
                choices: vec![
                    "For".to_string(),
                    "Against".to_string(),
                    "Abstain".to_string(),
                ],
                start: now,
                end: now + VOTING_WINDOW_SECS,
                discussion: request.discussion,
            };
            state
                .snapshot
                .submit_proposal(&submission)
                .await
                .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?
        }
    };

    let outcome = state
        .sync
        .link_snapshot(qci, &snapshot_id, StageReporter::disabled())
        .await
        .map_err(error_response)?;
    let (settlement, integrity_warning) = describe_settlement(&outcome.settlement);
    Ok(Json(WriteResponse {
        qci: outcome.qci,
        tx_hash: outcome.tx_hash.to_string(),
        explorer_url: explorer_tx_url(state.chain_id, outcome.tx_hash),
        cid: None,
        settlement,
        integrity_warning,
    }))
}

#[derive(Serialize)]
struct AbiResponse {
    contract_name: String,
    /// Set when the address is a proxy and the ABI belongs to the
    /// implementation.
    implementation: Option<String>,
    functions: Vec<ParsedFunction>,
}

async fn fetch_abi(
    Path((chain_id, address)): Path<(u64, String)>,
) -> Result<Json<AbiResponse>, (StatusCode, String)> {
    let fetched = fetch_contract_abi(chain_id, &address)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    let parsed = parse_abi(&fetched.abi).map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(AbiResponse {
        contract_name: fetched.contract_name,
        implementation: fetched.implementation,
        functions: parsed.functions,
    }))
}
