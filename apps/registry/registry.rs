use crate::content::ProposalStatus;
use alloy::{
    primitives::{Address, B256, U256},
    providers::Provider,
    sol,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

sol!(
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract QCIRegistry {
        struct QCIRecord {
            uint256 qciNumber;
            bytes32 contentHash;
            string ipfsUrl;
            uint8 status;
            uint256 version;
            address author;
            string snapshotProposalId;
        }

        event QCICreated(uint256 indexed qciNumber, address indexed author, bytes32 contentHash, string ipfsUrl);

        function createQCI(bytes32 contentHash, string calldata ipfsUrl) external returns (uint256);
        function updateQCI(uint256 qciNumber, bytes32 contentHash, string calldata ipfsUrl, string calldata changeNote) external;
        function setStatus(uint256 qciNumber, uint8 status) external;
        function linkSnapshotProposal(uint256 qciNumber, string calldata snapshotId) external;
        function getQCI(uint256 qciNumber) external view returns (QCIRecord memory);
        function nextQCINumber() external view returns (uint256);
    }
);

const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

/// The on-chain registry entry for one proposal. The content hash here
/// is the authority for integrity checks on fetched content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryRecord {
    pub qci: u64,
    pub content_hash: B256,
    pub ipfs_url: String,
    pub status: ProposalStatus,
    pub version: u64,
    pub author: Address,
    pub snapshot_id: Option<String>,
}

/// One state-changing registry call. Each is all-or-nothing on chain.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryCall {
    Create {
        content_hash: B256,
        ipfs_url: String,
    },
    Update {
        qci: u64,
        content_hash: B256,
        ipfs_url: String,
        change_note: String,
    },
    SetStatus {
        qci: u64,
        status: ProposalStatus,
    },
    LinkSnapshot {
        qci: u64,
        snapshot_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTx {
    pub tx_hash: B256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedTx {
    pub tx_hash: B256,
    /// Number assigned by the contract on creation, read from the event.
    pub assigned_qci: Option<u64>,
}

/// The closed set of revert causes we recognize. Anything else is
/// surfaced verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum RevertReason {
    MissingPermission,
    UnknownProposal,
    StatusTransitionNotAllowed,
    SnapshotAlreadyLinked,
    Other(String),
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertReason::MissingPermission => {
                f.write_str("you do not have permission to modify this proposal")
            }
            RevertReason::UnknownProposal => f.write_str("this proposal does not exist on chain"),
            RevertReason::StatusTransitionNotAllowed => {
                f.write_str("this status change is not allowed from the current status")
            }
            RevertReason::SnapshotAlreadyLinked => {
                f.write_str("a Snapshot proposal is already linked")
            }
            RevertReason::Other(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// User cancelled in the wallet. Quiet by policy, never retried.
    #[error("transaction rejected by signer")]
    SignerRejected,
    #[error("on-chain revert: {0}")]
    Revert(RevertReason),
    #[error("network error: {0}")]
    Network(String),
    /// Chain state is unknown, not necessarily adverse.
    #[error("confirmation timed out; the transaction may have succeeded, verify manually")]
    ConfirmationTimeout,
}

static EXECUTION_REVERTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)execution reverted").unwrap());

/// Classifies a raw provider/wallet error message. Substring matching is
/// acceptable here: the set of known revert reasons is small and stable.
/// Matching runs on the original text; lowercasing can change byte
/// lengths (Turkish dotted I) so its offsets must never index `text`.
pub fn classify_error_text(text: &str) -> RegistryError {
    let lower = text.to_lowercase();
    if lower.contains("user rejected")
        || lower.contains("user denied")
        || lower.contains("rejected the request")
    {
        return RegistryError::SignerRejected;
    }
    if let Some(marker) = EXECUTION_REVERTED_RE.find(text) {
        let tail = &text[marker.end()..];
        let reason = tail.trim_start_matches([':', ' ']).trim();
        return RegistryError::Revert(map_revert_reason(reason));
    }
    if lower.contains("revert") {
        return RegistryError::Revert(map_revert_reason(text));
    }
    RegistryError::Network(text.to_string())
}

pub fn map_revert_reason(reason: &str) -> RevertReason {
    let lower = reason.to_lowercase();
    if lower.contains("not authorized") || lower.contains("not an editor") {
        RevertReason::MissingPermission
    } else if lower.contains("does not exist") || lower.contains("unknown qci") {
        RevertReason::UnknownProposal
    } else if lower.contains("status") && (lower.contains("transition") || lower.contains("not allowed")) {
        RevertReason::StatusTransitionNotAllowed
    } else if lower.contains("already linked") {
        RevertReason::SnapshotAlreadyLinked
    } else {
        RevertReason::Other(reason.trim().to_string())
    }
}

/// Explorer link included with every successful write.
pub fn explorer_tx_url(chain_id: u64, tx_hash: B256) -> String {
    let base = match chain_id {
        1 => "https://etherscan.io",
        10 => "https://optimistic.etherscan.io",
        137 => "https://polygonscan.com",
        8453 => "https://basescan.org",
        42161 => "https://arbiscan.io",
        _ => "https://blockscan.com",
    };
    format!("{}/tx/{}", base, tx_hash)
}

/// The on-chain registry, authoritative for existence, status, content
/// hash/pointer and version. Write calls are never resubmitted
/// automatically: the chain cannot be assumed idempotent and a
/// resubmission could double-create.
#[async_trait]
pub trait ProposalRegistry: Send + Sync {
    async fn submit(&self, call: RegistryCall) -> Result<SubmittedTx, RegistryError>;
    async fn wait_for_confirmation(&self, tx: &SubmittedTx) -> Result<ConfirmedTx, RegistryError>;
    async fn get_record(&self, qci: u64) -> Result<Option<RegistryRecord>, RegistryError>;
    async fn list_records(&self) -> Result<Vec<RegistryRecord>, RegistryError>;
}

pub struct OnchainRegistry<P: Provider + Clone + 'static> {
    contract: QCIRegistry::QCIRegistryInstance<P>,
    provider: P,
}

impl<P: Provider + Clone + 'static> OnchainRegistry<P> {
    pub fn new(address: Address, provider: P) -> Self {
        Self {
            contract: QCIRegistry::new(address, provider.clone()),
            provider,
        }
    }

    fn record_from_sol(record: QCIRegistry::QCIRecord) -> Option<RegistryRecord> {
        let status = ProposalStatus::from_ordinal(record.status)?;
        Some(RegistryRecord {
            qci: record.qciNumber.to::<u64>(),
            content_hash: record.contentHash,
            ipfs_url: record.ipfsUrl,
            status,
            version: record.version.to::<u64>(),
            author: record.author,
            snapshot_id: if record.snapshotProposalId.is_empty() {
                None
            } else {
                Some(record.snapshotProposalId)
            },
        })
    }
}

#[async_trait]
impl<P: Provider + Clone + 'static> ProposalRegistry for OnchainRegistry<P> {
    #[instrument(skip(self))]
    async fn submit(&self, call: RegistryCall) -> Result<SubmittedTx, RegistryError> {
        let pending = match call {
            RegistryCall::Create {
                content_hash,
                ipfs_url,
            } => self.contract.createQCI(content_hash, ipfs_url).send().await,
            RegistryCall::Update {
                qci,
                content_hash,
                ipfs_url,
                change_note,
            } => {
                self.contract
                    .updateQCI(U256::from(qci), content_hash, ipfs_url, change_note)
                    .send()
                    .await
            }
            RegistryCall::SetStatus { qci, status } => {
                self.contract
                    .setStatus(U256::from(qci), status.ordinal())
                    .send()
                    .await
            }
            RegistryCall::LinkSnapshot { qci, snapshot_id } => {
                self.contract
                    .linkSnapshotProposal(U256::from(qci), snapshot_id)
                    .send()
                    .await
            }
        }
        .map_err(|e| classify_error_text(&e.to_string()))?;

        let tx_hash = *pending.tx_hash();
        debug!(tx_hash = %tx_hash, "registry call submitted");
        Ok(SubmittedTx { tx_hash })
    }

    #[instrument(skip(self))]
    async fn wait_for_confirmation(&self, tx: &SubmittedTx) -> Result<ConfirmedTx, RegistryError> {
        // One confirmation is sufficient for this registry.
        let started = tokio::time::Instant::now();
        loop {
            let receipt = self
                .provider
                .get_transaction_receipt(tx.tx_hash)
                .await
                .map_err(|e| RegistryError::Network(e.to_string()))?;

            if let Some(receipt) = receipt {
                if !receipt.status() {
                    return Err(RegistryError::Revert(RevertReason::Other(
                        "transaction reverted on chain".to_string(),
                    )));
                }
                let assigned_qci = receipt
                    .inner
                    .logs()
                    .iter()
                    .find_map(|log| log.log_decode::<QCIRegistry::QCICreated>().ok())
                    .map(|decoded| decoded.inner.data.qciNumber.to::<u64>());
                return Ok(ConfirmedTx {
                    tx_hash: tx.tx_hash,
                    assigned_qci,
                });
            }

            if started.elapsed() >= CONFIRMATION_TIMEOUT {
                return Err(RegistryError::ConfirmationTimeout);
            }
            tokio::time::sleep(CONFIRMATION_POLL_INTERVAL).await;
        }
    }

    async fn get_record(&self, qci: u64) -> Result<Option<RegistryRecord>, RegistryError> {
        match self.contract.getQCI(U256::from(qci)).call().await {
            Ok(record) => Ok(Self::record_from_sol(record)),
            Err(e) => match classify_error_text(&e.to_string()) {
                RegistryError::Revert(RevertReason::UnknownProposal) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn list_records(&self) -> Result<Vec<RegistryRecord>, RegistryError> {
        let next = self
            .contract
            .nextQCINumber()
            .call()
            .await
            .map_err(|e| classify_error_text(&e.to_string()))?
            .to::<u64>();

        let mut records = Vec::new();
        for qci in 1..next {
            if let Some(record) = self.get_record(qci).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_rejection_is_classified_quietly() {
        let err = classify_error_text("MetaMask Tx Signature: User denied transaction signature.");
        assert!(matches!(err, RegistryError::SignerRejected));
        let err = classify_error_text("user rejected action");
        assert!(matches!(err, RegistryError::SignerRejected));
    }

    #[test]
    fn known_reverts_map_to_specific_reasons() {
        let err = classify_error_text("execution reverted: caller is not authorized");
        assert!(matches!(
            err,
            RegistryError::Revert(RevertReason::MissingPermission)
        ));

        let err = classify_error_text("execution reverted: QCI does not exist");
        assert!(matches!(
            err,
            RegistryError::Revert(RevertReason::UnknownProposal)
        ));

        let err = classify_error_text("execution reverted: status transition not allowed");
        assert!(matches!(
            err,
            RegistryError::Revert(RevertReason::StatusTransitionNotAllowed)
        ));

        let err = classify_error_text("execution reverted: snapshot already linked");
        assert!(matches!(
            err,
            RegistryError::Revert(RevertReason::SnapshotAlreadyLinked)
        ));
    }

    #[test]
    fn unknown_reverts_are_kept_verbatim() {
        let err = classify_error_text("execution reverted: something exotic");
        match err {
            RegistryError::Revert(RevertReason::Other(raw)) => {
                assert_eq!(raw, "something exotic")
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn multibyte_prefixes_classify_without_panicking() {
        // Turkish dotted I grows by a byte under to_lowercase
        let err = classify_error_text("İşlem başarısız: Execution reverted: QCI does not exist");
        assert!(matches!(
            err,
            RegistryError::Revert(RevertReason::UnknownProposal)
        ));
    }

    #[test]
    fn revert_reason_casing_is_preserved() {
        let err = classify_error_text("Execution Reverted: Something Exotic");
        match err {
            RegistryError::Revert(RevertReason::Other(raw)) => {
                assert_eq!(raw, "Something Exotic")
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn anything_else_is_a_network_error() {
        let err = classify_error_text("connection refused");
        assert!(matches!(err, RegistryError::Network(_)));
    }

    #[test]
    fn explorer_links_cover_known_chains() {
        let hash = B256::ZERO;
        assert!(explorer_tx_url(8453, hash).starts_with("https://basescan.org/tx/"));
        assert!(explorer_tx_url(999_999, hash).starts_with("https://blockscan.com/tx/"));
    }
}
