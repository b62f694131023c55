use crate::transactions::{
    extract_transactions_from_markdown, render_transactions_section, MultisigTransactionGroup,
};
use alloy::primitives::{keccak256, B256};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

static FRONTMATTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A---\s*\n(.*?)\n---\s*\n?").unwrap());

/// Lifecycle status, mirrored by the on-chain registry's status enum.
/// Ordinals must stay aligned with the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Draft,
    #[serde(rename = "Ready for Snapshot")]
    ReadyForSnapshot,
    #[serde(rename = "Posted to Snapshot")]
    PostedToSnapshot,
    Approved,
    Rejected,
    Implemented,
}

impl ProposalStatus {
    pub fn ordinal(&self) -> u8 {
        match self {
            ProposalStatus::Draft => 0,
            ProposalStatus::ReadyForSnapshot => 1,
            ProposalStatus::PostedToSnapshot => 2,
            ProposalStatus::Approved => 3,
            ProposalStatus::Rejected => 4,
            ProposalStatus::Implemented => 5,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(ProposalStatus::Draft),
            1 => Some(ProposalStatus::ReadyForSnapshot),
            2 => Some(ProposalStatus::PostedToSnapshot),
            3 => Some(ProposalStatus::Approved),
            4 => Some(ProposalStatus::Rejected),
            5 => Some(ProposalStatus::Implemented),
            _ => None,
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalStatus::Draft => "Draft",
            ProposalStatus::ReadyForSnapshot => "Ready for Snapshot",
            ProposalStatus::PostedToSnapshot => "Posted to Snapshot",
            ProposalStatus::Approved => "Approved",
            ProposalStatus::Rejected => "Rejected",
            ProposalStatus::Implemented => "Implemented",
        };
        f.write_str(s)
    }
}

impl FromStr for ProposalStatus {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Draft" => Ok(ProposalStatus::Draft),
            "Ready for Snapshot" => Ok(ProposalStatus::ReadyForSnapshot),
            "Posted to Snapshot" => Ok(ProposalStatus::PostedToSnapshot),
            "Approved" => Ok(ProposalStatus::Approved),
            "Rejected" => Ok(ProposalStatus::Rejected),
            "Implemented" => Ok(ProposalStatus::Implemented),
            other => Err(ContentError::InvalidField {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// The full off-chain proposal document: frontmatter fields, markdown
/// body, and the embedded transaction groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalContent {
    pub qci: u64,
    pub title: String,
    pub network: String,
    pub status: ProposalStatus,
    pub author: String,
    pub implementor: String,
    pub implementation_date: Option<NaiveDate>,
    /// Snapshot proposal pointer, opaque to this system.
    pub proposal: Option<String>,
    pub created: NaiveDate,
    pub version: u64,
    pub body: String,
    #[serde(default)]
    pub transaction_groups: Vec<MultisigTransactionGroup>,
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("document has no frontmatter block")]
    MissingFrontmatter,
    #[error("frontmatter is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("frontmatter field '{field}' has invalid value '{value}'")]
    InvalidField { field: &'static str, value: String },
}

impl ProposalContent {
    /// Renders the document persisted to the content store: frontmatter,
    /// blank line, body, then the transactions section when any exist.
    pub fn to_document(&self) -> String {
        let mut doc = String::new();
        doc.push_str("---\n");
        doc.push_str(&format!("qci: {}\n", self.qci));
        doc.push_str(&format!("title: {}\n", self.title));
        doc.push_str(&format!("network: {}\n", self.network));
        doc.push_str(&format!("status: {}\n", self.status));
        doc.push_str(&format!("author: {}\n", self.author));
        doc.push_str(&format!("implementor: {}\n", self.implementor));
        doc.push_str(&format!(
            "implementation-date: {}\n",
            self.implementation_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "None".to_string())
        ));
        doc.push_str(&format!(
            "proposal: {}\n",
            self.proposal.as_deref().unwrap_or("None")
        ));
        doc.push_str(&format!("created: {}\n", self.created));
        doc.push_str(&format!("version: {}\n", self.version));
        doc.push_str("---\n\n");
        doc.push_str(self.body.trim_end());
        if !self.transaction_groups.is_empty() {
            doc.push_str(&render_transactions_section(&self.transaction_groups));
        } else {
            doc.push('\n');
        }
        doc
    }

    /// Parses a stored document back into structured content, tolerating
    /// the legacy transaction-block shapes.
    pub fn from_document(document: &str) -> Result<Self, ContentError> {
        let caps = FRONTMATTER_RE
            .captures(document)
            .ok_or(ContentError::MissingFrontmatter)?;
        let frontmatter = &caps[1];
        let rest = &document[caps.get(0).unwrap().end()..];

        let mut fields = std::collections::HashMap::new();
        for line in frontmatter.lines() {
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let get = |field: &'static str| -> Result<String, ContentError> {
            fields
                .get(field)
                .cloned()
                .ok_or(ContentError::MissingField(field))
        };

        let qci = get("qci")?
            .parse()
            .map_err(|_| ContentError::InvalidField {
                field: "qci",
                value: get("qci").unwrap_or_default(),
            })?;
        let status = get("status")?.parse()?;
        let created = parse_date("created", &get("created")?)?;
        let implementation_date = match fields.get("implementation-date").map(String::as_str) {
            None | Some("None") | Some("") => None,
            Some(raw) => Some(parse_date("implementation-date", raw)?),
        };
        let proposal = match fields.get("proposal").map(String::as_str) {
            None | Some("None") | Some("") => None,
            Some(raw) => Some(raw.to_string()),
        };
        let version = fields
            .get("version")
            .map(|v| {
                v.parse().map_err(|_| ContentError::InvalidField {
                    field: "version",
                    value: v.clone(),
                })
            })
            .transpose()?
            .unwrap_or(1);

        let extracted = extract_transactions_from_markdown(rest);

        Ok(ProposalContent {
            qci,
            title: get("title")?,
            network: get("network")?,
            status,
            author: get("author")?,
            implementor: fields
                .get("implementor")
                .cloned()
                .unwrap_or_else(|| "None".to_string()),
            implementation_date,
            proposal,
            created,
            version,
            body: extracted.content_without_transactions.trim().to_string(),
            transaction_groups: extracted.transaction_groups,
        })
    }
}

fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, ContentError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ContentError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

/// keccak256 of the canonical document bytes. The on-chain registry
/// stores this value; content fetched from the off-chain store must
/// hash back to it.
pub fn content_hash(document: &str) -> B256 {
    keccak256(document.as_bytes())
}
