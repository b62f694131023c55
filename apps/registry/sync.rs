use crate::api_client::FetchError;
use crate::cache::{CacheKey, CachedValue, ProposalCache};
use crate::content::{content_hash, ProposalContent, ProposalStatus};
use crate::index_api::IndexNotifier;
use crate::ipfs::{calculate_cid, ContentStore, UploadMetadata};
use crate::registry::{
    ConfirmedTx, ProposalRegistry, RegistryCall, RegistryError, RegistryRecord, RevertReason,
    SubmittedTx,
};
use alloy::primitives::{Address, B256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Delay before the post-write re-fetch, covering indexer and
/// read-replica propagation lag.
const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_secs(1);

/// Named stages of one logical write operation. Each stage awaits the
/// previous one; the UI status indicator follows the reported sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    Idle,
    Validating,
    Hashing,
    OnChainWrite,
    AwaitingConfirmation,
    OffChainUpload,
    Reconciling,
    Settled,
    WarnSettled,
    Failed,
}

/// Publishes stage transitions for one operation. Cheap to clone,
/// optional to observe.
#[derive(Debug, Clone)]
pub struct StageReporter {
    sender: Option<mpsc::UnboundedSender<WriteStage>>,
}

impl StageReporter {
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WriteStage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    fn set(&self, stage: WriteStage) {
        debug!(stage = ?stage, "write stage");
        if let Some(sender) = &self.sender {
            let _ = sender.send(stage);
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local pre-flight failure; the chain is never reached.
    #[error("validation failed: {0}")]
    Validation(String),
    /// User cancelled in the wallet; quiet by policy.
    #[error("transaction rejected by signer")]
    SignerRejected,
    #[error("{0}")]
    Revert(RevertReason),
    #[error("network error: {0}")]
    Network(String),
    /// Fetched content does not hash to the on-chain value.
    #[error("integrity check failed: {0}")]
    Integrity(String),
}

impl From<RegistryError> for SyncError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::SignerRejected => SyncError::SignerRejected,
            RegistryError::Revert(reason) => SyncError::Revert(reason),
            RegistryError::Network(message) => SyncError::Network(message),
            RegistryError::ConfirmationTimeout => {
                SyncError::Network("confirmation timed out".to_string())
            }
        }
    }
}

impl From<FetchError> for SyncError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::InvalidInput(message) => SyncError::Validation(message),
            // Carry the message, not the Display form, so prefixes
            // are not stacked.
            FetchError::Network(message) => SyncError::Network(message),
            other => SyncError::Network(other.to_string()),
        }
    }
}

/// Non-fatal mismatch between the pre-computed identifier and the one
/// the store returned. Logged and surfaced, never blocking.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityWarning {
    pub expected_cid: String,
    pub stored_cid: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Settled,
    WarnSettled(IntegrityWarning),
    /// Confirmation timed out; chain state is unknown, not adverse.
    Unverified,
}

/// Outcome of a create/update operation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Assigned proposal number. A create whose confirmation timed out
    /// settles before the contract assigns a number and reports 0 here;
    /// the number becomes known once the transaction is verified.
    pub qci: u64,
    pub tx_hash: B256,
    /// The pointer actually stored (the store's answer, even on
    /// mismatch).
    pub cid: String,
    pub content_hash: B256,
    pub settlement: Settlement,
}

/// Outcome of a status-change or snapshot-link operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOutcome {
    pub qci: u64,
    pub tx_hash: B256,
    pub settlement: Settlement,
}

/// Coordinates a proposal's three backing stores: the on-chain
/// registry, the content-addressed store, and the client cache (plus
/// the optional auxiliary index). All write operations run the staged
/// sequence of [`WriteStage`].
pub struct ProposalSynchronizer {
    registry: Arc<dyn ProposalRegistry>,
    store: Arc<dyn ContentStore>,
    notifier: Option<Arc<IndexNotifier>>,
    cache: Arc<ProposalCache>,
    registry_address: Option<Address>,
    propagation_delay: Duration,
}

impl ProposalSynchronizer {
    pub fn new(
        registry: Arc<dyn ProposalRegistry>,
        store: Arc<dyn ContentStore>,
        notifier: Option<Arc<IndexNotifier>>,
        cache: Arc<ProposalCache>,
        registry_address: Option<Address>,
    ) -> Self {
        Self {
            registry,
            store,
            notifier,
            cache,
            registry_address,
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
        }
    }

    /// Test hook; production keeps the 1s propagation delay.
    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    pub fn cache(&self) -> &Arc<ProposalCache> {
        &self.cache
    }

    /// Creates a new proposal: hash and cid are computed before any
    /// network traffic so the pointer can be pre-registered in the same
    /// transaction as the hash, and the upload happens only after the
    /// chain confirmed.
    #[instrument(skip_all, fields(title = %content.title))]
    pub async fn create(
        &self,
        content: &ProposalContent,
        stages: StageReporter,
    ) -> Result<WriteOutcome, SyncError> {
        stages.set(WriteStage::Validating);
        validate_required(content).inspect_err(|_| stages.set(WriteStage::Failed))?;

        stages.set(WriteStage::Hashing);
        let document = content.to_document();
        let cid = calculate_cid(&document);
        let ipfs_url = format!("ipfs://{cid}");
        let hash = content_hash(&document);

        let call = RegistryCall::Create {
            content_hash: hash,
            ipfs_url,
        };
        self.run_write(content, call, document, cid, hash, "create", stages)
            .await
    }

    /// Updates an existing proposal. A stale-version attempt fails on
    /// chain; the chain is the serialization point, not this client.
    #[instrument(skip_all, fields(qci = content.qci))]
    pub async fn update(
        &self,
        content: &ProposalContent,
        change_note: &str,
        stages: StageReporter,
    ) -> Result<WriteOutcome, SyncError> {
        stages.set(WriteStage::Validating);
        validate_required(content).inspect_err(|_| stages.set(WriteStage::Failed))?;
        if content.qci == 0 {
            stages.set(WriteStage::Failed);
            return Err(SyncError::Validation(
                "update requires an assigned proposal number".to_string(),
            ));
        }

        stages.set(WriteStage::Hashing);
        let document = content.to_document();
        let cid = calculate_cid(&document);
        let ipfs_url = format!("ipfs://{cid}");
        let hash = content_hash(&document);

        let call = RegistryCall::Update {
            qci: content.qci,
            content_hash: hash,
            ipfs_url,
            change_note: change_note.to_string(),
        };
        self.run_write(content, call, document, cid, hash, "update", stages)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_write(
        &self,
        content: &ProposalContent,
        call: RegistryCall,
        document: String,
        cid: String,
        hash: B256,
        operation: &'static str,
        stages: StageReporter,
    ) -> Result<WriteOutcome, SyncError> {
        stages.set(WriteStage::OnChainWrite);
        let submitted = match self.registry.submit(call).await {
            Ok(submitted) => submitted,
            Err(e) => {
                stages.set(WriteStage::Failed);
                return Err(e.into());
            }
        };

        stages.set(WriteStage::AwaitingConfirmation);
        let confirmed = match self.registry.wait_for_confirmation(&submitted).await {
            Ok(confirmed) => confirmed,
            Err(RegistryError::ConfirmationTimeout) => {
                return self.settle_unverified(content.qci, &submitted, cid, hash, stages);
            }
            Err(e) => {
                stages.set(WriteStage::Failed);
                return Err(e.into());
            }
        };
        let qci = confirmed.assigned_qci.unwrap_or(content.qci);

        // The off-chain write never precedes on-chain acknowledgment;
        // a failed chain write must not leave orphaned content behind.
        stages.set(WriteStage::OffChainUpload);
        let upload = self
            .store
            .upload(
                &document,
                &UploadMetadata {
                    qci,
                    title: content.title.clone(),
                    cid: cid.clone(),
                },
            )
            .await;
        let stored_cid = match upload {
            Ok(stored_cid) => stored_cid,
            Err(e) => {
                // The chain write confirmed, so the cached pre-write
                // cluster is no longer truth even though the operation
                // failed.
                stages.set(WriteStage::Failed);
                self.reconcile(qci, operation).await;
                return Err(e.into());
            }
        };

        let settlement = if stored_cid != cid {
            warn!(
                qci,
                expected_cid = %cid,
                stored_cid = %stored_cid,
                "content identifier mismatch after upload"
            );
            Settlement::WarnSettled(IntegrityWarning {
                expected_cid: cid,
                stored_cid: stored_cid.clone(),
            })
        } else {
            Settlement::Settled
        };

        stages.set(WriteStage::Reconciling);
        self.reconcile(qci, operation).await;

        stages.set(match settlement {
            Settlement::Settled => WriteStage::Settled,
            _ => WriteStage::WarnSettled,
        });
        info!(qci, tx_hash = %confirmed.tx_hash, operation, "proposal write settled");
        Ok(WriteOutcome {
            qci,
            tx_hash: confirmed.tx_hash,
            cid: stored_cid,
            content_hash: hash,
            settlement,
        })
    }

    fn settle_unverified(
        &self,
        qci: u64,
        submitted: &SubmittedTx,
        cid: String,
        hash: B256,
        stages: StageReporter,
    ) -> Result<WriteOutcome, SyncError> {
        warn!(
            tx_hash = %submitted.tx_hash,
            "confirmation timed out; the write may have succeeded, verify manually"
        );
        stages.set(WriteStage::WarnSettled);
        Ok(WriteOutcome {
            qci,
            tx_hash: submitted.tx_hash,
            cid,
            content_hash: hash,
            settlement: Settlement::Unverified,
        })
    }

    /// Status change with the optimistic-update contract: every cached
    /// list representation is patched before the chain call resolves,
    /// rolled back on failure, and marked stale (never asserted final)
    /// on success.
    #[instrument(skip(self, stages))]
    pub async fn set_status(
        &self,
        qci: u64,
        status: ProposalStatus,
        stages: StageReporter,
    ) -> Result<TxOutcome, SyncError> {
        let snapshot = self
            .cache
            .patch_list_status(self.registry_address, qci, status);

        stages.set(WriteStage::OnChainWrite);
        let submitted = match self
            .registry
            .submit(RegistryCall::SetStatus { qci, status })
            .await
        {
            Ok(submitted) => submitted,
            Err(e) => {
                self.rollback(snapshot);
                stages.set(WriteStage::Failed);
                return Err(e.into());
            }
        };

        stages.set(WriteStage::AwaitingConfirmation);
        let confirmed = match self.registry.wait_for_confirmation(&submitted).await {
            Ok(confirmed) => confirmed,
            Err(RegistryError::ConfirmationTimeout) => {
                // Chain state unknown: keep the optimistic value but
                // force a re-fetch.
                self.cache
                    .mark_stale(&CacheKey::list(self.registry_address));
                warn!(qci, "status change confirmation timed out, verify manually");
                stages.set(WriteStage::WarnSettled);
                return Ok(TxOutcome {
                    qci,
                    tx_hash: submitted.tx_hash,
                    settlement: Settlement::Unverified,
                });
            }
            Err(e) => {
                self.rollback(snapshot);
                stages.set(WriteStage::Failed);
                return Err(e.into());
            }
        };

        stages.set(WriteStage::Reconciling);
        self.reconcile(qci, "set_status").await;
        stages.set(WriteStage::Settled);
        Ok(TxOutcome {
            qci,
            tx_hash: confirmed.tx_hash,
            settlement: Settlement::Settled,
        })
    }

    /// Links the external vote pointer on chain.
    #[instrument(skip(self, stages))]
    pub async fn link_snapshot(
        &self,
        qci: u64,
        snapshot_id: &str,
        stages: StageReporter,
    ) -> Result<TxOutcome, SyncError> {
        stages.set(WriteStage::Validating);
        if snapshot_id.trim().is_empty() {
            stages.set(WriteStage::Failed);
            return Err(SyncError::Validation(
                "snapshot proposal id must not be empty".to_string(),
            ));
        }

        stages.set(WriteStage::OnChainWrite);
        let submitted = match self
            .registry
            .submit(RegistryCall::LinkSnapshot {
                qci,
                snapshot_id: snapshot_id.to_string(),
            })
            .await
        {
            Ok(submitted) => submitted,
            Err(e) => {
                stages.set(WriteStage::Failed);
                return Err(e.into());
            }
        };

        stages.set(WriteStage::AwaitingConfirmation);
        let confirmed: ConfirmedTx = match self.registry.wait_for_confirmation(&submitted).await {
            Ok(confirmed) => confirmed,
            Err(RegistryError::ConfirmationTimeout) => {
                warn!(qci, "snapshot link confirmation timed out, verify manually");
                stages.set(WriteStage::WarnSettled);
                return Ok(TxOutcome {
                    qci,
                    tx_hash: submitted.tx_hash,
                    settlement: Settlement::Unverified,
                });
            }
            Err(e) => {
                stages.set(WriteStage::Failed);
                return Err(e.into());
            }
        };

        stages.set(WriteStage::Reconciling);
        self.reconcile(qci, "link_snapshot").await;
        stages.set(WriteStage::Settled);
        Ok(TxOutcome {
            qci,
            tx_hash: confirmed.tx_hash,
            settlement: Settlement::Settled,
        })
    }

    fn rollback(&self, snapshot: Option<Vec<RegistryRecord>>) {
        if let Some(snapshot) = snapshot {
            self.cache.restore_list(self.registry_address, snapshot);
        }
    }

    /// Settle step: wait out propagation lag, drop the whole cache
    /// cluster, and nudge the auxiliary index.
    async fn reconcile(&self, qci: u64, operation: &'static str) {
        tokio::time::sleep(self.propagation_delay).await;
        self.cache.invalidate_proposal(qci, self.registry_address);
        if let Some(notifier) = &self.notifier {
            notifier.notify_detached(qci, operation);
        }
    }

    /// Read path for one proposal: registry record plus content,
    /// verified against the on-chain hash and cached.
    pub async fn get_proposal(
        &self,
        qci: u64,
    ) -> Result<(RegistryRecord, ProposalContent), SyncError> {
        let record_key = CacheKey::record(qci, self.registry_address);
        let content_key = CacheKey::content(qci, self.registry_address);
        if let (Some(CachedValue::Record(record)), Some(CachedValue::Content(content))) = (
            self.cache.get_fresh(&record_key),
            self.cache.get_fresh(&content_key),
        ) {
            return Ok((record, content));
        }

        let record = self
            .registry
            .get_record(qci)
            .await?
            .ok_or(SyncError::Revert(RevertReason::UnknownProposal))?;

        let document = self
            .store
            .fetch(&record.ipfs_url)
            .await
            .map_err(SyncError::from)?;

        let actual = content_hash(&document);
        if actual != record.content_hash {
            return Err(SyncError::Integrity(format!(
                "content for QCI {qci} hashes to {actual}, chain says {}",
                record.content_hash
            )));
        }

        let content = ProposalContent::from_document(&document)
            .map_err(|e| SyncError::Validation(e.to_string()))?;

        self.cache
            .insert(record_key, CachedValue::Record(record.clone()));
        self.cache
            .insert(content_key, CachedValue::Content(content.clone()));
        Ok((record, content))
    }

    /// Read path for the list, cache-first.
    pub async fn list_proposals(&self) -> Result<Vec<RegistryRecord>, SyncError> {
        let key = CacheKey::list(self.registry_address);
        if let Some(CachedValue::List(records)) = self.cache.get_fresh(&key) {
            return Ok(records);
        }
        let records = self.registry.list_records().await?;
        self.cache
            .insert(key, CachedValue::List(records.clone()));
        Ok(records)
    }
}

fn validate_required(content: &ProposalContent) -> Result<(), SyncError> {
    if content.title.trim().is_empty() {
        return Err(SyncError::Validation("title is required".to_string()));
    }
    if content.network.trim().is_empty() {
        return Err(SyncError::Validation("network is required".to_string()));
    }
    if content.author.trim().is_empty() {
        return Err(SyncError::Validation("author is required".to_string()));
    }
    Ok(())
}
