use crate::api_client::{with_retries, CancelSignal, FetchError, REQUEST_TIMEOUT};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const SNAPSHOT_GRAPHQL_ENDPOINT: &str = "https://hub.snapshot.org/graphql";
pub const SNAPSHOT_SEQUENCER_ENDPOINT: &str = "https://seq.snapshot.org";

/// A proposal submission to the external voting service. The returned
/// id is opaque to this system and stored in the content's `proposal`
/// field.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSubmission {
    pub space: String,
    pub title: String,
    pub body: String,
    pub choices: Vec<String>,
    pub start: i64,
    pub end: i64,
    pub discussion: String,
}

/// Represents a proposal from Snapshot
#[derive(Clone, Deserialize, Debug)]
pub struct SnapshotProposal {
    pub id: String,
    pub title: String,
    pub body: String,
    pub choices: Vec<String>,
    pub state: String,
    pub start: i64,
    pub end: i64,
    pub link: String,
}

#[derive(Deserialize, Debug)]
struct GraphQLResponse {
    data: Option<GraphQLProposalData>,
}

#[derive(Deserialize, Debug)]
struct GraphQLProposalData {
    proposal: Option<SnapshotProposal>,
}

#[derive(Deserialize, Debug)]
struct SubmissionResponse {
    id: String,
}

pub struct SnapshotClient {
    client: reqwest::Client,
    sequencer_url: String,
    graphql_url: String,
}

impl SnapshotClient {
    pub fn new() -> Self {
        Self::with_endpoints(
            SNAPSHOT_SEQUENCER_ENDPOINT.to_string(),
            SNAPSHOT_GRAPHQL_ENDPOINT.to_string(),
        )
    }

    pub fn with_endpoints(sequencer_url: String, graphql_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            sequencer_url,
            graphql_url,
        }
    }

    /// Submits a proposal for off-chain voting and returns its id.
    pub async fn submit_proposal(
        &self,
        submission: &SnapshotSubmission,
    ) -> Result<String, FetchError> {
        let response: SubmissionResponse = with_retries(CancelSignal::never(), |_| async {
            let res = self
                .client
                .post(&self.sequencer_url)
                .json(submission)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            if res.status().is_client_error() {
                return Err(FetchError::InvalidInput(format!(
                    "snapshot rejected submission: {}",
                    res.status()
                )));
            }
            res.error_for_status()
                .map_err(|e| FetchError::Network(e.to_string()))?
                .json::<SubmissionResponse>()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))
        })
        .await?;

        info!(id = %response.id, space = %submission.space, "snapshot proposal submitted");
        Ok(response.id)
    }

    /// Fetches an existing proposal for display. `None` when the id is
    /// unknown to the hub.
    pub async fn get_proposal(&self, id: &str) -> Result<Option<SnapshotProposal>, FetchError> {
        let graphql_query = format!(
            r#"
            {{
                proposal (id: {:?})
                {{
                    id
                    title
                    body
                    choices
                    state
                    start
                    end
                    link
                }}
            }}"#,
            id
        );

        let response: GraphQLResponse = with_retries(CancelSignal::never(), |_| async {
            let res = self
                .client
                .post(&self.graphql_url)
                .json(&serde_json::json!({ "query": graphql_query }))
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            res.error_for_status()
                .map_err(|e| FetchError::Network(e.to_string()))?
                .json::<GraphQLResponse>()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))
        })
        .await?;

        Ok(response.data.and_then(|d| d.proposal))
    }
}

impl Default for SnapshotClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submission_returns_the_assigned_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "0xsnap123"}"#)
            .create_async()
            .await;

        let client = SnapshotClient::with_endpoints(
            format!("{}/", server.url()),
            format!("{}/graphql", server.url()),
        );
        let id = client
            .submit_proposal(&SnapshotSubmission {
                space: "qidao.eth".to_string(),
                title: "QCI-1".to_string(),
                body: "body".to_string(),
                choices: vec!["For".to_string(), "Against".to_string()],
                start: 0,
                end: 1,
                discussion: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(id, "0xsnap123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_proposal_maps_to_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/graphql")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": {"proposal": null}}"#)
            .create_async()
            .await;

        let client = SnapshotClient::with_endpoints(
            format!("{}/", server.url()),
            format!("{}/graphql", server.url()),
        );
        let proposal = client.get_proposal("0xmissing").await.unwrap();
        assert!(proposal.is_none());
    }
}
