use crate::abi::{validate_input, InputError, ParsedFunction, ValidatedValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Matches the single `## Transactions` section: heading, optional blank
/// lines, then one fenced json block.
static TRANSACTIONS_SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(?:^|\n)## Transactions[ \t]*\n\s*```json[^\n]*\n(.*?)\n[ \t]*```[ \t]*\n?")
        .unwrap()
});

/// The unit of on-chain action metadata attached to a proposal.
///
/// `raw_abi` exists only while the editor holds the descriptor; it is
/// never serialized and never participates in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDescriptor {
    pub chain: String,
    pub contract_address: String,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multisig: Option<String>,
    #[serde(skip)]
    pub raw_abi: Option<String>,
}

impl PartialEq for TransactionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain
            && self.contract_address == other.contract_address
            && self.function_name == other.function_name
            && self.args == other.args
            && self.comment == other.comment
            && self.multisig == other.multisig
    }
}

impl TransactionDescriptor {
    /// Checks the descriptor against the function it was built from:
    /// exact argument count, every argument coercible to its declared
    /// type.
    pub fn validate_against(
        &self,
        function: &ParsedFunction,
    ) -> Result<Vec<ValidatedValue>, DescriptorError> {
        if self.function_name != function.name {
            return Err(DescriptorError::FunctionMismatch {
                descriptor: self.function_name.clone(),
                function: function.name.clone(),
            });
        }
        if self.args.len() != function.inputs.len() {
            return Err(DescriptorError::ArgumentCount {
                expected: function.inputs.len(),
                actual: self.args.len(),
            });
        }
        let mut validated = Vec::with_capacity(self.args.len());
        for (index, (arg, param)) in self.args.iter().zip(function.inputs.iter()).enumerate() {
            let text = match arg {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let value = validate_input(&text, param)
                .map_err(|source| DescriptorError::Argument { index, source })?;
            validated.push(value);
        }
        Ok(validated)
    }
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor is bound to '{descriptor}' but the function is '{function}'")]
    FunctionMismatch {
        descriptor: String,
        function: String,
    },
    #[error("function expects {expected} arguments, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },
    #[error("argument {index}: {source}")]
    Argument {
        index: usize,
        #[source]
        source: InputError,
    },
}

/// Canonical JSON rendering of a descriptor.
pub fn format_transaction(descriptor: &TransactionDescriptor) -> String {
    serde_json::to_string_pretty(descriptor).expect("descriptor serializes to JSON")
}

/// Inverse of [`format_transaction`]. The originating ABI is not part of
/// the serialized shape, so descriptors parse without it.
pub fn parse_transaction(text: &str) -> Result<TransactionDescriptor, serde_json::Error> {
    serde_json::from_str(text)
}

/// One multisig wallet and the transactions it owns. `multisig` is
/// always serialized (null for the implicit ownerless group) so the
/// canonical-shape check on stored documents stays structural.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultisigTransactionGroup {
    pub multisig: Option<String>,
    #[serde(default)]
    pub transactions: Vec<TransactionDescriptor>,
}

/// Stable partition by multisig owner; group order is the order of each
/// owner's first appearance, with ownerless descriptors forming one
/// implicit group.
pub fn group_transactions_by_multisig(
    descriptors: &[TransactionDescriptor],
) -> Vec<MultisigTransactionGroup> {
    let mut groups: Vec<MultisigTransactionGroup> = Vec::new();
    for descriptor in descriptors {
        match groups.iter_mut().find(|g| g.multisig == descriptor.multisig) {
            Some(group) => group.transactions.push(descriptor.clone()),
            None => groups.push(MultisigTransactionGroup {
                multisig: descriptor.multisig.clone(),
                transactions: vec![descriptor.clone()],
            }),
        }
    }
    groups
}

#[derive(Debug, Error)]
pub enum TransactionFormatError {
    #[error("transactions block is not a JSON array")]
    NotAnArray,
    #[error("transactions block entry is malformed: {0}")]
    MalformedEntry(#[source] serde_json::Error),
}

/// Normalizes any of the three historical on-disk shapes to canonical
/// groups. This is the only place format detection happens; every
/// consumer goes through it.
///
/// Detection order matters:
/// 1. a single-element array whose sole element is itself an array is
///    the double-nesting bug artifact and gets unwrapped one level;
/// 2. if the first element carries both `multisig` and `transactions`
///    keys the array is already canonical;
/// 3. otherwise it is the legacy flat shape, one implicit group.
pub fn normalize_transaction_groups(
    value: serde_json::Value,
) -> Result<Vec<MultisigTransactionGroup>, TransactionFormatError> {
    let serde_json::Value::Array(mut items) = value else {
        return Err(TransactionFormatError::NotAnArray);
    };

    if items.len() == 1 && items[0].is_array() {
        if let serde_json::Value::Array(inner) = items.remove(0) {
            items = inner;
        }
    }

    if items.is_empty() {
        return Ok(vec![]);
    }

    let canonical = items[0]
        .as_object()
        .is_some_and(|o| o.contains_key("multisig") && o.contains_key("transactions"));

    if canonical {
        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).map_err(TransactionFormatError::MalformedEntry)
            })
            .collect()
    } else {
        let transactions = items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).map_err(TransactionFormatError::MalformedEntry)
            })
            .collect::<Result<Vec<TransactionDescriptor>, _>>()?;
        Ok(vec![MultisigTransactionGroup {
            multisig: None,
            transactions,
        }])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedTransactions {
    pub content_without_transactions: String,
    pub transactions: Vec<TransactionDescriptor>,
    pub transaction_groups: Vec<MultisigTransactionGroup>,
}

impl ExtractedTransactions {
    fn unchanged(content: &str) -> Self {
        Self {
            content_without_transactions: content.to_string(),
            transactions: vec![],
            transaction_groups: vec![],
        }
    }
}

/// Splits the embedded transactions section out of a proposal body.
///
/// A missing section is not an error, and neither is a corrupt one:
/// historical documents exist with broken JSON, and display must never
/// hard-fail on them. Corruption is logged and the content returned
/// unchanged.
pub fn extract_transactions_from_markdown(content: &str) -> ExtractedTransactions {
    let Some(caps) = TRANSACTIONS_SECTION.captures(content) else {
        return ExtractedTransactions::unchanged(content);
    };

    let json_text = &caps[1];
    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed transactions block, ignoring");
            return ExtractedTransactions::unchanged(content);
        }
    };

    let groups = match normalize_transaction_groups(value) {
        Ok(groups) => groups,
        Err(e) => {
            warn!(error = %e, "unrecognized transactions block shape, ignoring");
            return ExtractedTransactions::unchanged(content);
        }
    };

    let section = caps.get(0).unwrap();
    let mut without = String::with_capacity(content.len());
    without.push_str(&content[..section.start()]);
    without.push_str(&content[section.end()..]);

    let transactions = groups
        .iter()
        .flat_map(|g| g.transactions.iter().cloned())
        .collect();

    ExtractedTransactions {
        content_without_transactions: without.trim_end().to_string(),
        transactions,
        transaction_groups: groups,
    }
}

/// Renders groups as the trailing `## Transactions` section.
/// `extract_transactions_from_markdown` round-trips this exactly.
pub fn render_transactions_section(groups: &[MultisigTransactionGroup]) -> String {
    let json = serde_json::to_string_pretty(groups).expect("groups serialize to JSON");
    format!("\n\n## Transactions\n\n```json\n{}\n```\n", json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(function: &str, multisig: Option<&str>) -> TransactionDescriptor {
        TransactionDescriptor {
            chain: "Base".to_string(),
            contract_address: "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".to_string(),
            function_name: function.to_string(),
            args: vec![
                json!("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"),
                json!("1000"),
            ],
            comment: Some("approve spend".to_string()),
            multisig: multisig.map(str::to_string),
            raw_abi: None,
        }
    }

    #[test]
    fn format_parse_round_trip_is_identity() {
        let tx = descriptor("approve", Some("0x1111111111111111111111111111111111111111"));
        let parsed = parse_transaction(&format_transaction(&tx)).unwrap();
        assert_eq!(parsed, tx);
    }

    #[test]
    fn parse_accepts_descriptor_without_abi() {
        let text = r#"{
            "chain": "Base",
            "contractAddress": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
            "functionName": "approve",
            "args": ["0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", "1000"]
        }"#;
        let parsed = parse_transaction(text).unwrap();
        assert_eq!(parsed.function_name, "approve");
        assert!(parsed.raw_abi.is_none());
        assert!(parsed.multisig.is_none());
    }

    #[test]
    fn abi_is_excluded_from_equality_and_serialization() {
        let mut with_abi = descriptor("approve", None);
        with_abi.raw_abi = Some("[]".to_string());
        let without_abi = descriptor("approve", None);
        assert_eq!(with_abi, without_abi);
        assert!(!format_transaction(&with_abi).contains("rawAbi"));
    }

    #[test]
    fn grouping_preserves_first_appearance_order() {
        let a = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let b = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        let txs = vec![
            descriptor("one", Some(a)),
            descriptor("two", None),
            descriptor("three", Some(b)),
            descriptor("four", Some(a)),
        ];
        let groups = group_transactions_by_multisig(&txs);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].multisig.as_deref(), Some(a));
        assert_eq!(groups[0].transactions.len(), 2);
        assert_eq!(groups[1].multisig, None);
        assert_eq!(groups[2].multisig.as_deref(), Some(b));
    }

    #[test]
    fn grouping_is_idempotent_through_flatten() {
        let a = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let txs = vec![
            descriptor("one", Some(a)),
            descriptor("two", None),
            descriptor("three", Some(a)),
        ];
        let groups = group_transactions_by_multisig(&txs);
        let flattened: Vec<_> = groups
            .iter()
            .flat_map(|g| g.transactions.iter().cloned())
            .collect();
        let regrouped = group_transactions_by_multisig(&flattened);
        assert_eq!(regrouped, groups);
    }

    #[test]
    fn canonical_shape_round_trips() {
        let groups = vec![
            MultisigTransactionGroup {
                multisig: Some("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()),
                transactions: vec![descriptor(
                    "approve",
                    Some("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                )],
            },
            MultisigTransactionGroup {
                multisig: None,
                transactions: vec![descriptor("transfer", None)],
            },
        ];
        let body = format!("Intro text.{}", render_transactions_section(&groups));
        let extracted = extract_transactions_from_markdown(&body);
        assert_eq!(extracted.transaction_groups, groups);
        assert_eq!(extracted.content_without_transactions, "Intro text.");
        assert_eq!(extracted.transactions.len(), 2);
    }

    #[test]
    fn legacy_flat_shape_becomes_one_implicit_group() {
        let flat = json!([
            {"chain": "Base", "contractAddress": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
             "functionName": "approve", "args": []},
            {"chain": "Base", "contractAddress": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
             "functionName": "transfer", "args": []}
        ]);
        let groups = normalize_transaction_groups(flat).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].multisig, None);
        assert_eq!(groups[0].transactions.len(), 2);
    }

    #[test]
    fn double_nested_bug_normalizes_like_flat() {
        let inner = json!([
            {"chain": "Base", "contractAddress": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
             "functionName": "approve", "args": []},
            {"chain": "Base", "contractAddress": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
             "functionName": "transfer", "args": []}
        ]);
        let nested = json!([inner.clone()]);
        assert_eq!(
            normalize_transaction_groups(nested).unwrap(),
            normalize_transaction_groups(inner).unwrap()
        );
    }

    #[test]
    fn double_nested_canonical_also_unwraps() {
        let canonical = json!([
            {"multisig": null, "transactions": [
                {"chain": "Base", "contractAddress": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
                 "functionName": "approve", "args": []}
            ]}
        ]);
        let nested = json!([canonical.clone()]);
        assert_eq!(
            normalize_transaction_groups(nested).unwrap(),
            normalize_transaction_groups(canonical).unwrap()
        );
    }

    #[test]
    fn missing_section_returns_content_unchanged() {
        let body = "# Title\n\nJust prose, no transactions.";
        let extracted = extract_transactions_from_markdown(body);
        assert_eq!(extracted.content_without_transactions, body);
        assert!(extracted.transactions.is_empty());
        assert!(extracted.transaction_groups.is_empty());
    }

    #[test]
    fn malformed_json_block_is_ignored_not_fatal() {
        let body = "Intro.\n\n## Transactions\n\n```json\n{not valid json\n```\n";
        let extracted = extract_transactions_from_markdown(body);
        assert_eq!(extracted.content_without_transactions, body);
        assert!(extracted.transactions.is_empty());
        assert!(extracted.transaction_groups.is_empty());
    }

    #[test]
    fn empty_array_block_yields_no_groups() {
        let body = "Intro.\n\n## Transactions\n\n```json\n[]\n```\n";
        let extracted = extract_transactions_from_markdown(body);
        assert_eq!(extracted.content_without_transactions, "Intro.");
        assert!(extracted.transaction_groups.is_empty());
    }

    #[test]
    fn validate_against_checks_count_and_types() {
        use crate::abi::parse_abi;
        let abi = parse_abi(
            r#"[{"type":"function","name":"approve",
                "inputs":[{"name":"spender","type":"address"},{"name":"amount","type":"uint256"}],
                "outputs":[]}]"#,
        )
        .unwrap();
        let function = abi.function("approve").unwrap();

        let tx = descriptor("approve", None);
        assert!(tx.validate_against(function).is_ok());

        let mut short = tx.clone();
        short.args.pop();
        assert!(matches!(
            short.validate_against(function),
            Err(DescriptorError::ArgumentCount { .. })
        ));

        let mut bad = tx.clone();
        bad.args[1] = json!("not a number");
        assert!(matches!(
            bad.validate_against(function),
            Err(DescriptorError::Argument { index: 1, .. })
        ));
    }
}
