//! Pipeline driver: dataset rows in, validated images and outcome records
//! out.
//!
//! The driver resolves descriptors into immutable specs, hands them to the
//! layered builder, optionally runs the differential validator over every
//! build success, and emits one structured outcome record per instance.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::builder::{self, BuildConfig, FailedInstance};
use crate::dataset::DatasetSource;
use crate::docker::DockerClient;
use crate::instance::InstanceSpec;
use crate::progress::{ProgressCounters, ProgressMonitor};
use crate::tables::repo_version_spec;
use crate::templates::ManifestFetcher;
use crate::utils::safe_name;
use crate::validator::{validate_image, ValidationResult};

/// Full configuration of one `build` run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dataset: String,
    pub split: String,
    pub registry: String,
    pub limit: Option<usize>,
    pub instance_ids: Option<Vec<String>>,
    pub build: BuildConfig,
    pub validate: bool,
    pub validation_timeout: u64,
    pub push: bool,
}

/// Aggregate counts for the CLI summary and exit code.
#[derive(Debug, Default, Clone)]
pub struct PipelineSummary {
    pub total: usize,
    pub built: usize,
    pub build_failed: usize,
    pub validated_passed: usize,
    pub validated_failed: usize,
}

/// One per-instance outcome line in `results.jsonl`.
#[derive(Debug, Serialize)]
pub struct InstanceOutcome {
    pub instance_id: String,
    pub image: Option<String>,
    pub built: bool,
    /// `None` when validation was not requested or not reached.
    pub validated: Option<bool>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl InstanceOutcome {
    fn new(instance_id: impl Into<String>, image: Option<String>, built: bool) -> Self {
        Self {
            instance_id: instance_id.into(),
            image,
            built,
            validated: None,
            reason: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Run the full build (and optionally validate) pipeline.
pub async fn run_build(config: &PipelineConfig) -> Result<PipelineSummary> {
    let docker = DockerClient::connect().context("could not connect to the Docker daemon")?;
    let fetcher = ManifestFetcher::new();
    let counters = ProgressCounters::new();
    let monitor = ProgressMonitor::start(counters.clone(), Duration::from_secs(30));

    let mut outcomes: Vec<InstanceOutcome> = Vec::new();
    let mut summary = PipelineSummary::default();

    // ---- Load descriptors (streaming) ----
    info!(dataset = %config.dataset, split = %config.split, "loading dataset");
    let source = DatasetSource::new(&config.dataset, &config.split);
    let id_filter = config.instance_ids.clone();
    let rows = source
        .collect_filtered(config.limit, |row| {
            if let Some(ids) = &id_filter {
                if !ids.iter().any(|id| id == &row.instance_id) {
                    return false;
                }
            }
            if repo_version_spec(&row.repo, &row.version).is_none() {
                info!(
                    instance = %row.instance_id,
                    repo = %row.repo,
                    version = %row.version,
                    "skipping instance with no repo-version spec"
                );
                return false;
            }
            true
        })
        .await
        .context("dataset streaming failed")?;
    info!(count = rows.len(), "instances selected");

    // ---- Resolve specs (manifest fetches happen here, once per instance) ----
    let mut specs: Vec<Arc<InstanceSpec>> = Vec::new();
    for row in rows {
        summary.total += 1;
        let instance_id = row.instance_id.clone();
        match InstanceSpec::resolve(row, &config.registry, &fetcher).await {
            Ok(spec) => specs.push(Arc::new(spec)),
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "skipping unresolvable instance");
                summary.build_failed += 1;
                let mut outcome = InstanceOutcome::new(instance_id, None, false);
                outcome.reason = e.to_string();
                outcomes.push(outcome);
            }
        }
    }

    // ---- Build ----
    let (successful, failed) =
        builder::build_instance_images(&docker, specs, &config.build, &counters).await?;
    summary.built = successful.len();
    summary.build_failed += failed.len();

    for FailedInstance { spec, reason } in failed {
        let mut outcome = InstanceOutcome::new(
            spec.instance_id.clone(),
            Some(spec.instance_image_key()),
            false,
        );
        outcome.reason = reason;
        outcomes.push(outcome);
    }

    // ---- Validate (optional), bounded by the same worker-pool width ----
    let mut survivors: Vec<Arc<InstanceSpec>> = Vec::new();
    if config.validate {
        info!(count = successful.len(), "validating built images");
        let pool = Arc::new(Semaphore::new(config.build.max_workers.max(1)));
        let mut futures = Vec::with_capacity(successful.len());
        for spec in successful {
            let pool = pool.clone();
            let docker = docker.clone();
            let counters = counters.clone();
            let timeout = config.validation_timeout;
            futures.push(async move {
                let _permit = pool.acquire().await.expect("semaphore closed");
                let image = spec.instance_image_key();
                let result = validate_image(&docker, &spec, &image, timeout).await;
                match &result {
                    Ok(r) if r.passed => {
                        counters.validations_passed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        counters.validations_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                (spec, image, result)
            });
        }

        for (spec, image, result) in futures::future::join_all(futures).await {
            let mut outcome =
                InstanceOutcome::new(spec.instance_id.clone(), Some(image.clone()), true);
            match result {
                Ok(validation) if validation.passed => {
                    summary.validated_passed += 1;
                    outcome.validated = Some(true);
                    outcome.reason = validation.reason.clone();
                    survivors.push(spec);
                }
                Ok(validation) => {
                    summary.validated_failed += 1;
                    outcome.validated = Some(false);
                    outcome.reason = validation.reason.clone();
                    reject_image(&docker, &spec, &image, &validation, &config.build.output_dir)
                        .await;
                }
                Err(e) => {
                    summary.validated_failed += 1;
                    outcome.validated = Some(false);
                    outcome.reason = e.to_string();
                    warn!(instance = %spec.instance_id, error = %e, "validation errored");
                }
            }
            outcomes.push(outcome);
        }
    } else {
        for spec in successful {
            let mut outcome = InstanceOutcome::new(
                spec.instance_id.clone(),
                Some(spec.instance_image_key()),
                true,
            );
            outcome.reason = "built".to_string();
            outcomes.push(outcome);
            survivors.push(spec);
        }
    }

    // ---- Push the images that made it through every gate ----
    if config.push {
        for spec in &survivors {
            let image = spec.instance_image_key();
            match docker.push_image(&image).await {
                Ok(()) => info!(image = %image, "pushed"),
                Err(e) => warn!(image = %image, error = %e, "push failed"),
            }
        }
    }

    write_outcomes(&config.build.output_dir, &outcomes)?;
    monitor.stop().await;
    Ok(summary)
}

/// Remove a validation-rejected image and persist the detailed log.
async fn reject_image(
    docker: &DockerClient,
    spec: &InstanceSpec,
    image: &str,
    validation: &ValidationResult,
    output_dir: &Path,
) {
    warn!(
        instance = %spec.instance_id,
        reason = %validation.reason,
        "validation failed, removing image"
    );
    docker.remove_image(image).await;

    let log_file = output_dir
        .join("failed_logs")
        .join(format!("validation_{}.log", safe_name(&spec.instance_id)));
    if let Some(parent) = log_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&log_file, validation.detailed_log()) {
        warn!(path = %log_file.display(), error = %e, "could not persist validation log");
    }
}

fn write_outcomes(output_dir: &Path, outcomes: &[InstanceOutcome]) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join("results.jsonl");
    let mut lines = String::new();
    for outcome in outcomes {
        lines.push_str(&serde_json::to_string(outcome)?);
        lines.push('\n');
    }
    std::fs::write(&path, lines)?;
    info!(path = %path.display(), count = outcomes.len(), "outcome records written");
    Ok(())
}

/// Validate one already-built image against its dataset record.
///
/// Used by the `validate` CLI command; the caller decides the exit code.
pub async fn run_validate_single(
    image: &str,
    instance_id: &str,
    dataset: &str,
    split: &str,
    registry: &str,
    timeout: u64,
) -> Result<ValidationResult> {
    let source = DatasetSource::new(dataset, split);
    let raw = source.find_instance(instance_id).await?;

    // No manifest fetch: validation never touches the env image key.
    let spec = InstanceSpec::from_record(raw, registry, crate::templates::EnvManifest::None)
        .with_context(|| format!("could not resolve instance '{instance_id}'"))?;

    let docker = DockerClient::connect().context("could not connect to the Docker daemon")?;
    let result = validate_image(&docker, &spec, image, timeout).await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_to_json() {
        let mut outcome = InstanceOutcome::new("django__django-1", Some("img:1".to_string()), true);
        outcome.validated = Some(true);
        outcome.reason = "all checks passed (both pre-patch and post-patch)".to_string();
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"instance_id\":\"django__django-1\""));
        assert!(json.contains("\"built\":true"));
        assert!(json.contains("\"validated\":true"));
    }

    #[test]
    fn test_write_outcomes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = vec![
            InstanceOutcome::new("a", None, false),
            InstanceOutcome::new("b", Some("img:2".to_string()), true),
        ];
        write_outcomes(dir.path(), &outcomes).unwrap();
        let content = std::fs::read_to_string(dir.path().join("results.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().all(|l| l.starts_with('{')));
    }
}
