// SPDX-License-Identifier: MIT
//! Request fingerprinting — derives a stable task identity from request
//! parameters.
//!
//! Identical normalized input always yields the identical task id, across
//! process restarts, which is what makes result reuse through persisted
//! state possible. When the caller supplies an externally-meaningful
//! `message_id` it is trusted verbatim, letting upstream systems dictate
//! identity.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest (128 bits).
const TASK_ID_LEN: usize = 32;

const DEFAULT_LANGUAGE: &str = "en";

/// Normalized snapshot of the inputs that identify a research task.
///
/// This is stored immutably on the task record; mutating a request after
/// fingerprinting has no effect on the task it maps to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestParams {
    /// The research query text.
    pub query: String,
    /// BCP-47-ish language tag. Missing defaults to `"en"`.
    pub language: Option<String>,
    /// Maximum number of results the pipeline should return.
    pub max_results: Option<u32>,
    /// Enable live web search during research.
    pub enable_search: Option<bool>,
    /// Include citations in the report.
    pub enable_citations: Option<bool>,
    /// Candidate model identifiers. Order-insensitive for identity.
    pub models: Vec<String>,
    /// Upstream provider identifier.
    pub provider: Option<String>,
    pub user_id: Option<String>,
    pub topic_id: Option<String>,
    pub session_id: Option<String>,
    /// Externally-supplied identity override. When present and non-empty it
    /// is used verbatim as the task id and no fingerprint is computed.
    pub message_id: Option<String>,
}

impl RequestParams {
    /// Canonical form used for hashing: trimmed, case-folded query, defaulted
    /// language, sorted + deduped model list, trimmed identifiers.
    fn normalized(&self) -> RequestParams {
        let mut models: Vec<String> = self
            .models
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        models.sort();
        models.dedup();

        let trim_opt = |v: &Option<String>| -> Option<String> {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        RequestParams {
            query: self.query.trim().to_lowercase(),
            language: Some(
                trim_opt(&self.language)
                    .map(|l| l.to_lowercase())
                    .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            ),
            max_results: Some(self.max_results.unwrap_or(5)),
            enable_search: Some(self.enable_search.unwrap_or(true)),
            enable_citations: Some(self.enable_citations.unwrap_or(false)),
            models,
            provider: trim_opt(&self.provider),
            user_id: trim_opt(&self.user_id),
            topic_id: trim_opt(&self.topic_id),
            session_id: trim_opt(&self.session_id),
            // Never hashed — passthrough ids short-circuit before hashing.
            message_id: None,
        }
    }
}

/// Compute the canonical task id for a request.
///
/// An explicit non-empty `message_id` wins. Otherwise the normalized
/// parameters are serialized with lexicographically sorted keys
/// (serde_json maps are BTreeMaps) and digested with SHA-256, truncated
/// to [`TASK_ID_LEN`] hex characters.
pub fn task_id_for(params: &RequestParams) -> String {
    if let Some(id) = params.message_id.as_deref() {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }

    let n = params.normalized();
    // Build the value explicitly so field set and key names stay stable even
    // if the struct grows serde attributes later.
    let canonical = json!({
        "enableCitations": n.enable_citations,
        "enableSearch": n.enable_search,
        "language": n.language,
        "maxResults": n.max_results,
        "models": n.models,
        "provider": n.provider,
        "query": n.query,
        "sessionId": n.session_id,
        "topicId": n.topic_id,
        "userId": n.user_id,
    });

    let serialized = canonical.to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    hex::encode(digest)[..TASK_ID_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base_params() -> RequestParams {
        RequestParams {
            query: "Quantum Error Correction".to_string(),
            language: Some("en".to_string()),
            max_results: Some(10),
            models: vec!["sonar-pro".to_string(), "gpt-4o".to_string()],
            provider: Some("openai".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn identical_params_same_id() {
        assert_eq!(task_id_for(&base_params()), task_id_for(&base_params()));
    }

    #[test]
    fn id_is_fixed_length_hex() {
        let id = task_id_for(&base_params());
        assert_eq!(id.len(), TASK_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn query_case_and_whitespace_ignored() {
        let mut a = base_params();
        a.query = "  quantum error correction ".to_string();
        assert_eq!(task_id_for(&a), task_id_for(&base_params()));
    }

    #[test]
    fn model_order_ignored() {
        let mut a = base_params();
        a.models = vec!["gpt-4o".to_string(), "sonar-pro".to_string()];
        assert_eq!(task_id_for(&a), task_id_for(&base_params()));
    }

    #[test]
    fn missing_language_defaults() {
        let mut a = base_params();
        a.language = None;
        let mut b = base_params();
        b.language = Some("EN".to_string());
        assert_eq!(task_id_for(&a), task_id_for(&b));
    }

    #[test]
    fn different_query_different_id() {
        let mut a = base_params();
        a.query = "something else entirely".to_string();
        assert_ne!(task_id_for(&a), task_id_for(&base_params()));
    }

    #[test]
    fn message_id_passthrough() {
        let mut a = base_params();
        a.message_id = Some("  msg-12345 ".to_string());
        assert_eq!(task_id_for(&a), "msg-12345");
    }

    #[test]
    fn empty_message_id_falls_back_to_hash() {
        let mut a = base_params();
        a.message_id = Some("   ".to_string());
        assert_eq!(task_id_for(&a), task_id_for(&base_params()));
    }

    proptest! {
        #[test]
        fn fingerprint_is_deterministic(
            query in ".{0,64}",
            lang in proptest::option::of("[a-zA-Z]{2}"),
            max in proptest::option::of(0u32..100),
            models in proptest::collection::vec("[a-z0-9-]{1,16}", 0..4),
        ) {
            let p = RequestParams {
                query: query.clone(),
                language: lang.clone(),
                max_results: max,
                models: models.clone(),
                ..Default::default()
            };
            prop_assert_eq!(task_id_for(&p), task_id_for(&p.clone()));
        }

        #[test]
        fn whitespace_padding_never_changes_identity(query in "[a-z ]{1,40}") {
            let p = RequestParams { query: query.clone(), ..Default::default() };
            let padded = RequestParams {
                query: format!("  {query}  "),
                ..Default::default()
            };
            prop_assert_eq!(task_id_for(&p), task_id_for(&padded));
        }
    }
}
