//! Dependency-manifest fetching from raw.githubusercontent.com.
//!
//! Per repo there is an ordered list of candidate paths; the first path
//! that answers 200 at the instance's setup commit wins. requirements.txt
//! files may reference siblings via `-r other.txt`, which are followed
//! recursively relative to the containing file.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::SpecError;
use crate::tables::{env_yml_paths, reqs_paths, GITHUB_RAW_URL};

const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_5) AppleWebKit/537.36";

/// Lines excluded when inlining requirements files.
fn excluded(line: &str) -> bool {
    let trimmed = line.trim_start();
    ["-e .", "#", ".[test"]
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}

/// HTTP fetcher for dependency manifests.
pub struct ManifestFetcher {
    client: Client,
}

impl Default for ManifestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
        }
    }

    /// GET a raw file, returning its body on 200 and `None` otherwise.
    async fn get_raw(&self, repo: &str, commit: &str, path: &str) -> Option<String> {
        let url = format!("{GITHUB_RAW_URL}/{repo}/{commit}/{path}");
        let response = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "manifest candidate miss");
            return None;
        }
        response.text().await.ok()
    }

    /// Fetch and inline requirements.txt for `repo` at `commit`.
    ///
    /// Nested `-r` includes are resolved relative to the directory of the
    /// file that references them; excluded lines are dropped everywhere.
    pub async fn requirements(&self, repo: &str, commit: &str) -> Result<String, SpecError> {
        let candidates = reqs_paths(repo);
        let mut found: Option<(&str, String)> = None;
        for path in candidates {
            if let Some(text) = self.get_raw(repo, commit, path).await {
                found = Some((path, text));
                break;
            }
        }
        let (req_path, text) = found.ok_or_else(|| SpecError::ManifestFetch {
            kind: "requirements.txt",
            repo: repo.to_string(),
            commit: commit.to_string(),
            reason: format!("no candidate of {candidates:?} answered 200"),
        })?;

        let req_dir = match req_path.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        };

        let mut original_req: Vec<&str> = Vec::new();
        let mut additional_reqs: Vec<String> = Vec::new();

        for line in text.split('\n') {
            if let Some(file_name) = line.trim_start().strip_prefix("-r") {
                let file_name = file_name.trim();
                let nested_path = if req_dir.is_empty() {
                    file_name.to_string()
                } else {
                    format!("{req_dir}/{file_name}")
                };
                if let Some(nested) = self.get_raw(repo, commit, &nested_path).await {
                    for extra_line in nested.split('\n') {
                        if !excluded(extra_line) {
                            additional_reqs.push(extra_line.to_string());
                        }
                    }
                }
            } else if !excluded(line) {
                original_req.push(line);
            }
        }

        additional_reqs.push(original_req.join("\n"));
        Ok(additional_reqs.join("\n"))
    }

    /// Fetch environment.yml for `repo` at `commit`, renaming the env.
    pub async fn environment_yml(
        &self,
        repo: &str,
        commit: &str,
        env_name: &str,
    ) -> Result<String, SpecError> {
        let candidates = env_yml_paths(repo);
        let mut found: Option<String> = None;
        for path in candidates {
            if let Some(text) = self.get_raw(repo, commit, path).await {
                found = Some(text);
                break;
            }
        }
        let text = found.ok_or_else(|| SpecError::ManifestFetch {
            kind: "environment.yml",
            repo: repo.to_string(),
            commit: commit.to_string(),
            reason: format!("no candidate of {candidates:?} answered 200"),
        })?;

        let cleaned: Vec<String> = text
            .split('\n')
            .map(|line| {
                if line.starts_with("name:") {
                    format!("name: {env_name}")
                } else {
                    line.to_string()
                }
            })
            .collect();
        Ok(cleaned.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_lines() {
        assert!(excluded("-e ."));
        assert!(excluded("  -e .[dev]"));
        assert!(excluded("# a comment"));
        assert!(excluded(".[test]"));
        assert!(!excluded("pytest==7.4.0"));
        assert!(!excluded("-r requirements-dev.txt"));
    }

    #[test]
    fn test_env_yml_rename_logic() {
        // Exercise the same line transform environment_yml applies.
        let text = "name: upstream-env\ndependencies:\n  - python=3.11";
        let renamed: Vec<String> = text
            .split('\n')
            .map(|line| {
                if line.starts_with("name:") {
                    "name: testbed".to_string()
                } else {
                    line.to_string()
                }
            })
            .collect();
        assert_eq!(renamed[0], "name: testbed");
        assert_eq!(renamed[1], "dependencies:");
    }
}
