//! Three-tier layered image builds: base → env → instance.
//!
//! Bases are few and heavy, so they build serially. Env images are
//! deduplicated by their content-addressed key and fanned out through a
//! bounded worker pool; instance images build in the same pool once every
//! env they depend on has settled. Failed builds persist their Dockerfile,
//! scripts, and build log for post-mortems.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::docker::DockerClient;
use crate::error::BuildError;
use crate::instance::InstanceSpec;
use crate::progress::ProgressCounters;
use crate::utils::safe_name;

/// Knobs for a build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Bounded pool width for env and instance builds.
    pub max_workers: usize,
    /// Remove-and-rebuild images that already exist.
    pub force_rebuild: bool,
    /// Persist Dockerfile/scripts/log for successful builds too.
    pub verbose_logs: bool,
    /// Root for `failed_logs/` and `build_logs/`.
    pub output_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            force_rebuild: false,
            verbose_logs: false,
            output_dir: PathBuf::from("output/swe_kiln"),
        }
    }
}

/// A spec that did not make it to a built, validated image.
#[derive(Debug)]
pub struct FailedInstance {
    pub spec: Arc<InstanceSpec>,
    pub reason: String,
}

/// One deduplicated env build: the first spec carrying a key snapshots the
/// script, Dockerfile, and platform for everyone sharing it.
#[derive(Debug, Clone)]
struct EnvPlan {
    key: String,
    script: String,
    dockerfile: String,
    platform: &'static str,
}

/// Unique env plans in first-seen order. Shared keys collapse to a single
/// plan, so the engine sees one build per distinct key.
fn dedup_env_plans(specs: &[Arc<InstanceSpec>]) -> Vec<EnvPlan> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut plans = Vec::new();
    for spec in specs {
        let key = spec.env_image_key();
        if !seen.insert(key.clone()) {
            continue;
        }
        plans.push(EnvPlan {
            key,
            script: spec.setup_env_script(),
            dockerfile: spec.env_dockerfile(),
            platform: spec.platform(),
        });
    }
    plans
}

fn save_failure_log(output_dir: &Path, category: &str, name: &str, content: &str) -> PathBuf {
    let log_file = output_dir
        .join("failed_logs")
        .join(format!("{category}_{}.log", safe_name(name)));
    if let Some(parent) = log_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&log_file, content) {
        warn!(path = %log_file.display(), error = %e, "could not persist failure log");
    }
    log_file
}

/// Message plus the full persistable text for a build error.
fn failure_text(err: &BuildError) -> (String, String) {
    match err {
        BuildError::Failed {
            message, build_log, ..
        } => (
            message.clone(),
            format!("Error: {message}\n\n--- Build Output ---\n{build_log}"),
        ),
        other => (other.to_string(), other.to_string()),
    }
}

/// Write the build context (scripts + Dockerfile) and run one image build,
/// persisting artifacts per the `verbose_logs` policy.
async fn run_one_build(
    docker: DockerClient,
    output_dir: PathBuf,
    verbose_logs: bool,
    category: &'static str,
    tag: String,
    scripts: Vec<(&'static str, String)>,
    dockerfile: String,
    platform: String,
    nocache: bool,
) -> Result<(), String> {
    let write_context = |dir: &Path| -> std::io::Result<()> {
        for (name, content) in &scripts {
            std::fs::write(dir.join(name), content)?;
        }
        std::fs::write(dir.join("Dockerfile"), &dockerfile)
    };

    if verbose_logs {
        let build_dir = output_dir
            .join("build_logs")
            .join(category)
            .join(safe_name(&tag));
        std::fs::create_dir_all(&build_dir).map_err(|e| e.to_string())?;
        write_context(&build_dir).map_err(|e| e.to_string())?;

        match docker.build_image(&tag, &build_dir, &platform, nocache).await {
            Ok(log) => {
                let _ = std::fs::write(build_dir.join("build.log"), log);
                Ok(())
            }
            Err(err) => {
                let (message, text) = failure_text(&err);
                let _ = std::fs::write(build_dir.join("build.log"), format!("FAILED: {text}"));
                Err(message)
            }
        }
    } else {
        let tmpdir = tempfile::tempdir().map_err(|e| e.to_string())?;
        write_context(tmpdir.path()).map_err(|e| e.to_string())?;

        match docker
            .build_image(&tag, tmpdir.path(), &platform, nocache)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let (message, text) = failure_text(&err);
                save_failure_log(&output_dir, category, &tag, &text);
                Err(message)
            }
        }
    }
}

/// Build the base images (typically one per architecture), serially.
///
/// A base failure aborts the run: nothing downstream can build without it.
pub async fn build_base_images(
    docker: &DockerClient,
    specs: &[Arc<InstanceSpec>],
    cfg: &BuildConfig,
) -> Result<(), BuildError> {
    let mut seen: HashSet<String> = HashSet::new();
    for spec in specs {
        let key = spec.base_image_key();
        if !seen.insert(key.clone()) {
            continue;
        }

        if docker.image_exists(&key).await {
            if !cfg.force_rebuild {
                info!(image = %key, "base image already exists, skipping");
                continue;
            }
            docker.remove_image(&key).await;
        }

        info!(image = %key, "building base image");
        run_one_build(
            docker.clone(),
            cfg.output_dir.clone(),
            cfg.verbose_logs,
            "base",
            key.clone(),
            Vec::new(),
            spec.base_dockerfile(),
            spec.platform().to_string(),
            cfg.force_rebuild,
        )
        .await
        .map_err(|message| BuildError::Failed {
            image: key,
            message,
            build_log: String::new(),
        })?;
    }

    info!("base images ready");
    Ok(())
}

/// Build all distinct env images through the worker pool.
///
/// Returns the set of env keys whose build failed; instances depending on
/// them are excluded downstream but siblings are unaffected.
pub async fn build_env_images(
    docker: &DockerClient,
    specs: &[Arc<InstanceSpec>],
    cfg: &BuildConfig,
    counters: &ProgressCounters,
) -> Result<HashSet<String>, BuildError> {
    build_base_images(docker, specs, cfg).await?;

    let mut to_build = Vec::new();
    for plan in dedup_env_plans(specs) {
        if docker.image_exists(&plan.key).await {
            if !cfg.force_rebuild {
                continue;
            }
            docker.remove_image(&plan.key).await;
        }
        to_build.push(plan);
    }

    if to_build.is_empty() {
        info!("no env images need to be built");
        return Ok(HashSet::new());
    }

    info!(
        count = to_build.len(),
        workers = cfg.max_workers,
        "building env images"
    );

    let pool = Arc::new(Semaphore::new(cfg.max_workers.max(1)));
    let mut futures = Vec::with_capacity(to_build.len());
    for plan in to_build {
        let pool = pool.clone();
        let docker = docker.clone();
        let output_dir = cfg.output_dir.clone();
        let verbose_logs = cfg.verbose_logs;
        let nocache = cfg.force_rebuild;
        let counters = counters.clone();
        futures.push(async move {
            let _permit = pool.acquire().await.expect("semaphore closed");
            let result = run_one_build(
                docker,
                output_dir,
                verbose_logs,
                "env",
                plan.key.clone(),
                vec![("setup_env.sh", plan.script)],
                plan.dockerfile,
                plan.platform.to_string(),
                nocache,
            )
            .await;
            match result {
                Ok(()) => {
                    counters.envs_built.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(message) => {
                    counters.envs_failed.fetch_add(1, Ordering::Relaxed);
                    Some((plan.key, message))
                }
            }
        });
    }

    let mut failed = HashSet::new();
    for failure in futures::future::join_all(futures).await.into_iter().flatten() {
        warn!(image = %failure.0, error = %failure.1, "env image build failed");
        failed.insert(failure.0);
    }

    if failed.is_empty() {
        info!("all env images built successfully");
    } else {
        warn!(failed = failed.len(), "some env images failed");
    }
    Ok(failed)
}

/// Build every instance image, after bases and envs have settled.
///
/// Returns the `(successful, failed)` partition; the two always sum to the
/// input size.
pub async fn build_instance_images(
    docker: &DockerClient,
    specs: Vec<Arc<InstanceSpec>>,
    cfg: &BuildConfig,
    counters: &ProgressCounters,
) -> Result<(Vec<Arc<InstanceSpec>>, Vec<FailedInstance>), BuildError> {
    let env_failed = build_env_images(docker, &specs, cfg, counters).await?;

    let mut failed: Vec<FailedInstance> = Vec::new();
    let mut buildable: Vec<Arc<InstanceSpec>> = Vec::new();
    for spec in specs {
        let env_key = spec.env_image_key();
        if env_failed.contains(&env_key) {
            failed.push(FailedInstance {
                spec,
                reason: format!("env image build failed: {env_key}"),
            });
        } else {
            buildable.push(spec);
        }
    }
    if !failed.is_empty() {
        warn!(
            skipped = failed.len(),
            "instances skipped due to failed env builds"
        );
    }

    info!(
        count = buildable.len(),
        workers = cfg.max_workers,
        "building instance images"
    );

    let pool = Arc::new(Semaphore::new(cfg.max_workers.max(1)));
    let mut futures = Vec::with_capacity(buildable.len());
    for spec in buildable {
        let pool = pool.clone();
        let docker = docker.clone();
        let output_dir = cfg.output_dir.clone();
        let verbose_logs = cfg.verbose_logs;
        let force_rebuild = cfg.force_rebuild;
        let counters = counters.clone();
        futures.push(async move {
            let _permit = pool.acquire().await.expect("semaphore closed");
            let key = spec.instance_image_key();

            if !force_rebuild && docker.image_exists(&key).await {
                counters.instances_built.fetch_add(1, Ordering::Relaxed);
                return (spec, None);
            }

            let result = run_one_build(
                docker,
                output_dir,
                verbose_logs,
                "instance",
                key,
                vec![("setup_repo.sh", spec.setup_repo_script())],
                spec.instance_dockerfile(),
                spec.platform().to_string(),
                force_rebuild,
            )
            .await;
            match result {
                Ok(()) => {
                    counters.instances_built.fetch_add(1, Ordering::Relaxed);
                    (spec, None)
                }
                Err(message) => {
                    counters.instances_failed.fetch_add(1, Ordering::Relaxed);
                    (spec, Some(message))
                }
            }
        });
    }

    let mut successful = Vec::new();
    for (spec, error) in futures::future::join_all(futures).await {
        match error {
            None => successful.push(spec),
            Some(reason) => {
                warn!(instance = %spec.instance_id, error = %reason, "instance image build failed");
                failed.push(FailedInstance { spec, reason });
            }
        }
    }

    if failed.is_empty() {
        info!("all instance images built successfully");
    } else {
        warn!(failed = failed.len(), "some instance images failed to build");
    }
    Ok((successful, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::RawInstance;
    use crate::templates::EnvManifest;

    fn spec(instance_id: &str, repo: &str, version: &str) -> Arc<InstanceSpec> {
        let raw: RawInstance = serde_json::from_value(serde_json::json!({
            "instance_id": instance_id,
            "repo": repo,
            "version": version,
            "base_commit": format!("{instance_id}commit"),
            "test_patch": "",
            "patch": "",
            "FAIL_TO_PASS": ["t1"],
            "PASS_TO_PASS": [],
        }))
        .unwrap();
        Arc::new(InstanceSpec::from_record(raw, "reg/", EnvManifest::None).unwrap())
    }

    #[test]
    fn test_dedup_env_plans_shared_key() {
        // two sympy instances share the same env command list => one plan
        let specs = vec![
            spec("sympy__sympy-1", "sympy/sympy", "1.12"),
            spec("sympy__sympy-2", "sympy/sympy", "1.12"),
            spec("pytest-dev__pytest-1", "pytest-dev/pytest", "7.4"),
        ];
        let plans = dedup_env_plans(&specs);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].key, specs[0].env_image_key());
        assert_eq!(plans[1].key, specs[2].env_image_key());
    }

    #[test]
    fn test_dedup_env_plans_snapshots_first() {
        let specs = vec![spec("sympy__sympy-1", "sympy/sympy", "1.12")];
        let plans = dedup_env_plans(&specs);
        assert_eq!(plans[0].script, specs[0].setup_env_script());
        assert_eq!(plans[0].dockerfile, specs[0].env_dockerfile());
    }

    #[test]
    fn test_save_failure_log_path_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_failure_log(dir.path(), "env", "reg/sympy_base:abc", "boom");
        assert!(path.ends_with("failed_logs/env_reg_sympy_base__abc.log"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "boom");
    }

    #[test]
    fn test_failure_text_includes_partial_log() {
        let err = BuildError::Failed {
            image: "img:1".to_string(),
            message: "step 4 exploded".to_string(),
            build_log: "Step 1/4 ...".to_string(),
        };
        let (message, text) = failure_text(&err);
        assert_eq!(message, "step 4 exploded");
        assert!(text.contains("--- Build Output ---"));
        assert!(text.contains("Step 1/4"));
    }
}
