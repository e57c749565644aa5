//! Streaming instance source backed by the HuggingFace datasets-server.
//!
//! Fetches benchmark instance records page by page from the rows API, so a
//! `--limit 5` run never downloads the full dataset. Records arrive with
//! `FAIL_TO_PASS` / `PASS_TO_PASS` either as real JSON lists or as
//! JSON-encoded strings; both shapes are accepted at this boundary.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::DatasetError;

/// Base URL for the HuggingFace datasets-server rows API.
const HUGGINGFACE_ROWS_API: &str = "https://datasets-server.huggingface.co/rows";

/// Maximum rows per request accepted by the rows API.
const MAX_PAGE_SIZE: usize = 100;

/// One raw instance record as it appears in the dataset.
///
/// This is the untrusted boundary type; `instance::InstanceSpec` performs
/// the table lookups and invariant checks.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInstance {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub base_commit: String,
    #[serde(default)]
    pub test_patch: String,
    /// Gold patch fixing the bug; may be empty.
    #[serde(default)]
    pub patch: String,
    #[serde(
        rename = "FAIL_TO_PASS",
        default,
        deserialize_with = "list_or_json_string"
    )]
    pub fail_to_pass: Vec<String>,
    #[serde(
        rename = "PASS_TO_PASS",
        default,
        deserialize_with = "list_or_json_string"
    )]
    pub pass_to_pass: Vec<String>,
    #[serde(default)]
    pub environment_setup_commit: Option<String>,
}

/// Accept either `["a", "b"]` or the JSON-encoded string `"[\"a\", \"b\"]"`.
fn list_or_json_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        Json(String),
    }

    match ListOrString::deserialize(deserializer)? {
        ListOrString::List(v) => Ok(v),
        ListOrString::Json(s) if s.trim().is_empty() => Ok(Vec::new()),
        ListOrString::Json(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
    }
}

/// Response envelope from the rows API.
#[derive(Debug, Deserialize)]
struct RowsResponse {
    rows: Vec<RowEnvelope>,
    num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RowEnvelope {
    #[allow(dead_code)]
    row_idx: usize,
    row: RawInstance,
}

/// Streaming reader over one dataset split.
pub struct DatasetSource {
    http_client: Client,
    dataset_name: String,
    split: String,
}

impl DatasetSource {
    /// Create a source for `dataset_name` (e.g. `R2E-Gym/SWE-Bench-Verified`)
    /// and `split`.
    pub fn new(dataset_name: impl Into<String>, split: impl Into<String>) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            dataset_name: dataset_name.into(),
            split: split.into(),
        }
    }

    /// Fetch one page of rows starting at `offset`.
    async fn fetch_page(&self, offset: usize) -> Result<(Vec<RawInstance>, usize), DatasetError> {
        let url = format!(
            "{}?dataset={}&config=default&split={}&offset={}&length={}",
            HUGGINGFACE_ROWS_API, self.dataset_name, self.split, offset, MAX_PAGE_SIZE
        );

        let response = self
            .http_client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| DatasetError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(DatasetError::BadStatus {
                status: status.as_u16(),
                body: crate::utils::truncate(&body, 300),
            });
        }

        let page: RowsResponse = response
            .json()
            .await
            .map_err(|e| DatasetError::Parse(e.to_string()))?;

        let total = page.num_rows_total.unwrap_or(usize::MAX);
        Ok((page.rows.into_iter().map(|r| r.row).collect(), total))
    }

    /// Stream records, invoking `keep` on each until `limit` records were
    /// accepted or the split is exhausted.
    ///
    /// `keep` decides whether a record counts towards `limit`; rejected
    /// records (unknown repo, filtered id) do not.
    pub async fn collect_filtered(
        &self,
        limit: Option<usize>,
        mut keep: impl FnMut(&RawInstance) -> bool,
    ) -> Result<Vec<RawInstance>, DatasetError> {
        let mut out: Vec<RawInstance> = Vec::new();
        let mut offset = 0usize;

        loop {
            let (rows, total) = self.fetch_page(offset).await?;
            if rows.is_empty() {
                break;
            }
            offset += rows.len();

            for row in rows {
                if keep(&row) {
                    out.push(row);
                }
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }

            debug!(
                dataset = %self.dataset_name,
                fetched = offset,
                accepted = out.len(),
                "dataset page consumed"
            );

            if offset >= total {
                break;
            }
        }

        Ok(out)
    }

    /// Find a single record by instance id.
    pub async fn find_instance(&self, instance_id: &str) -> Result<RawInstance, DatasetError> {
        let found = self
            .collect_filtered(Some(1), |row| row.instance_id == instance_id)
            .await?;
        found
            .into_iter()
            .next()
            .ok_or_else(|| DatasetError::InstanceNotFound(instance_id.to_string()))
    }
}
