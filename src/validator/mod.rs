//! Two-step differential validation of built instance images.
//!
//! Validation requires BOTH steps to pass:
//!
//! Step 1 — pre-patch (bug-bearing commit, no gold patch):
//!   - F2P tests must FAIL (they reveal the bug)
//!   - P2P tests must PASS (they are stable)
//!
//! Step 2 — post-patch (gold patch applied):
//!   - F2P tests must PASS (the fix resolves them)
//!   - P2P tests must PASS (no regressions)
//!
//! A declared test that never shows up in the parsed output counts as
//! wrong in either step: an unobserved F2P cannot confirm the bug, and an
//! unobserved P2P cannot rule out a regression.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::docker::DockerClient;
use crate::error::ValidateError;
use crate::instance::InstanceSpec;
use crate::tables::{END_TEST_OUTPUT, START_TEST_OUTPUT};
use crate::utils::{safe_name, strip_ansi, tail, truncate};

/// Fallback marker emitted by common test runners, consulted only when the
/// start sentinel is absent.
const SUMMARY_FALLBACK: &str = "short test summary info";

/// Ordered patch-application attempts; the first clean exit wins.
const APPLY_ATTEMPTS: &[&str] = &[
    "git apply -v /tmp/gold_patch.diff",
    "git apply -v --reject /tmp/gold_patch.diff",
    "patch --batch --fuzz=5 -p1 -i /tmp/gold_patch.diff",
];

/// Observed status of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Parse eval output into `{test_id -> status}`.
///
/// Reads the region between the start/end sentinels; when no start
/// sentinel exists, falls back to the "short test summary info" section.
/// Returns `None` when neither marker is present (a hard validation
/// failure upstream); a marked region with zero result lines yields an
/// empty map, which classification treats as every declared test missing.
pub fn parse_log(raw: &str) -> Option<HashMap<String, TestStatus>> {
    static STATUS_RE: OnceLock<Regex> = OnceLock::new();
    let status_re =
        STATUS_RE.get_or_init(|| Regex::new(r"^(PASSED|FAILED|ERROR)\s+(\S+)").unwrap());

    let cleaned = strip_ansi(raw);
    let lines: Vec<&str> = cleaned.lines().collect();

    let mut start_idx: Option<usize> = None;
    let mut end_idx: Option<usize> = None;
    for (i, line) in lines.iter().enumerate() {
        if line.contains(START_TEST_OUTPUT) {
            start_idx = Some(i + 1);
        }
        if line.contains(END_TEST_OUTPUT) {
            end_idx = Some(i);
            break;
        }
    }

    if start_idx.is_none() {
        start_idx = lines
            .iter()
            .position(|line| line.contains(SUMMARY_FALLBACK))
            .map(|i| i + 1);
        end_idx = None;
    }

    let start = start_idx?.min(lines.len());
    let end = end_idx.unwrap_or(lines.len()).max(start);
    let region = &lines[start..end];

    let mut results = HashMap::new();
    for line in region {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        if let Some(caps) = status_re.captures(stripped) {
            let status = match &caps[1] {
                "PASSED" => TestStatus::Passed,
                // ERROR is a failure mode for classification purposes
                _ => TestStatus::Failed,
            };
            results.insert(caps[2].to_string(), status);
        }
    }

    Some(results)
}

/// Which validation step a classification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    PrePatch,
    PostPatch,
}

impl Step {
    fn label(&self) -> &'static str {
        match self {
            Step::PrePatch => "PRE",
            Step::PostPatch => "POST",
        }
    }
}

/// Per-step classification tallies.
#[derive(Debug, Default, Clone)]
pub struct StepCounts {
    pub f2p_correct: usize,
    pub f2p_wrong: usize,
    pub p2p_correct: usize,
    pub p2p_wrong: usize,
    pub details: Vec<String>,
}

impl StepCounts {
    pub fn clean(&self) -> bool {
        self.f2p_wrong == 0 && self.p2p_wrong == 0
    }
}

/// Classify every declared test against the parsed results for one step.
///
/// Pre-patch, an F2P test is correct when it is observed and not PASSED;
/// post-patch it must be PASSED. P2P tests must be PASSED in both steps.
pub fn classify(
    step: Step,
    f2p: &[String],
    p2p: &[String],
    results: &HashMap<String, TestStatus>,
) -> StepCounts {
    let mut counts = StepCounts::default();
    let label = step.label();

    for test_id in f2p {
        match (step, results.get(test_id)) {
            (_, None) => {
                counts.f2p_wrong += 1;
                counts.details.push(format!("{label} F2P missing: {test_id}"));
            }
            (Step::PrePatch, Some(TestStatus::Passed)) => {
                counts.f2p_wrong += 1;
                counts
                    .details
                    .push(format!("{label} F2P unexpectedly PASSED: {test_id}"));
            }
            (Step::PrePatch, Some(_)) => counts.f2p_correct += 1,
            (Step::PostPatch, Some(TestStatus::Passed)) => counts.f2p_correct += 1,
            (Step::PostPatch, Some(_)) => {
                counts.f2p_wrong += 1;
                counts
                    .details
                    .push(format!("{label} F2P still FAILED: {test_id}"));
            }
        }
    }

    for test_id in p2p {
        match results.get(test_id) {
            None => {
                counts.p2p_wrong += 1;
                counts.details.push(format!("{label} P2P missing: {test_id}"));
            }
            Some(TestStatus::Passed) => counts.p2p_correct += 1,
            Some(_) => {
                counts.p2p_wrong += 1;
                counts
                    .details
                    .push(format!("{label} P2P unexpectedly FAILED: {test_id}"));
            }
        }
    }

    counts
}

/// Failure reason for a step with nonzero wrong counts, or `None`.
fn step_failure_reason(step: Step, counts: &StepCounts) -> Option<String> {
    if counts.clean() {
        return None;
    }
    let (step_name, f2p_verb) = match step {
        Step::PrePatch => ("step 1 (pre-patch)", "did not fail pre-patch"),
        Step::PostPatch => ("step 2 (post-patch)", "did not pass post-patch"),
    };
    let p2p_when = match step {
        Step::PrePatch => "pre-patch",
        Step::PostPatch => "post-patch",
    };
    let mut reasons = Vec::new();
    if counts.f2p_wrong > 0 {
        reasons.push(format!("{} F2P tests {f2p_verb}", counts.f2p_wrong));
    }
    if counts.p2p_wrong > 0 {
        reasons.push(format!(
            "{} P2P tests did not pass {p2p_when}",
            counts.p2p_wrong
        ));
    }
    Some(format!("{step_name} failed: {}", reasons.join("; ")))
}

/// Combined result of the two-step validation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub reason: String,

    // Step 1 (pre-patch) classification
    pub pre_f2p_correct: usize,
    pub pre_f2p_wrong: usize,
    pub pre_p2p_correct: usize,
    pub pre_p2p_wrong: usize,

    // Step 2 (post-patch) classification
    pub post_f2p_correct: usize,
    pub post_f2p_wrong: usize,
    pub post_p2p_correct: usize,
    pub post_p2p_wrong: usize,

    pub pre_raw: String,
    pub post_raw: String,
    pub details: Vec<String>,
}

impl ValidationResult {
    fn failure(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            ..Default::default()
        }
    }

    fn record_pre(&mut self, counts: &StepCounts) {
        self.pre_f2p_correct = counts.f2p_correct;
        self.pre_f2p_wrong = counts.f2p_wrong;
        self.pre_p2p_correct = counts.p2p_correct;
        self.pre_p2p_wrong = counts.p2p_wrong;
        self.details.extend(counts.details.iter().cloned());
    }

    fn record_post(&mut self, counts: &StepCounts) {
        self.post_f2p_correct = counts.f2p_correct;
        self.post_f2p_wrong = counts.f2p_wrong;
        self.post_p2p_correct = counts.p2p_correct;
        self.post_p2p_wrong = counts.p2p_wrong;
        self.details.extend(counts.details.iter().cloned());
    }

    /// One-line summary of both steps.
    pub fn summary(&self) -> String {
        let status = if self.passed { "PASS" } else { "FAIL" };
        format!(
            "[{status}] pre(F2P_fail={} F2P_pass={} P2P_pass={} P2P_fail={}) \
             post(F2P_pass={} F2P_fail={} P2P_pass={} P2P_fail={}) | {}",
            self.pre_f2p_correct,
            self.pre_f2p_wrong,
            self.pre_p2p_correct,
            self.pre_p2p_wrong,
            self.post_f2p_correct,
            self.post_f2p_wrong,
            self.post_p2p_correct,
            self.post_p2p_wrong,
            self.reason
        )
    }

    /// Multi-line report with anomaly details and bounded raw outputs.
    pub fn detailed_log(&self) -> String {
        let mut lines = vec![self.summary(), String::new()];
        for d in &self.details {
            lines.push(format!("  {d}"));
        }
        lines.push(String::new());
        lines.push("--- Pre-patch raw output ---".to_string());
        lines.push(tail(&self.pre_raw, 2000).to_string());
        lines.push(String::new());
        lines.push("--- Post-patch raw output ---".to_string());
        lines.push(tail(&self.post_raw, 2000).to_string());
        lines.join("\n")
    }
}

/// Drop-armed container cleanup: the container is removed on every exit
/// path, including panics, without masking the primary error.
struct ContainerGuard {
    docker: DockerClient,
    id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: DockerClient, id: String) -> Self {
        Self {
            docker,
            id,
            armed: true,
        }
    }

    async fn cleanup(mut self) {
        self.armed = false;
        self.docker.cleanup_container(&self.id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.armed {
            let docker = self.docker.clone();
            let id = self.id.clone();
            tokio::spawn(async move {
                docker.cleanup_container(&id).await;
            });
        }
    }
}

/// Run the two-step validation of `image` against `spec`.
///
/// `timeout_secs` bounds each eval exec independently. Infrastructure
/// faults surface as `Err`; everything the contract can reject is a
/// `ValidationResult` with `passed = false`.
pub async fn validate_image(
    docker: &DockerClient,
    spec: &InstanceSpec,
    image: &str,
    timeout_secs: u64,
) -> Result<ValidationResult, ValidateError> {
    if spec.fail_to_pass.is_empty() {
        return Ok(ValidationResult::failure("no FAIL_TO_PASS tests defined"));
    }

    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() % 1_000_000)
        .unwrap_or(0);
    let container_name = format!("swe-kiln-val-{}-{suffix}", safe_name(&spec.instance_id));

    let container_id = docker
        .create_idle_container(&container_name, image, spec.platform())
        .await
        .map_err(|e| ValidateError::ContainerCreate {
            image: image.to_string(),
            reason: e.to_string(),
        })?;
    let guard = ContainerGuard::new(docker.clone(), container_id.clone());
    docker.start_container(&container_id).await?;
    debug!(container = %container_name, image = %image, "validation container started");

    let result = run_validation(docker, &container_id, spec, timeout_secs).await;
    guard.cleanup().await;

    if let Ok(result) = &result {
        info!(instance = %spec.instance_id, passed = result.passed, "validation finished");
    }
    result
}

async fn run_validation(
    docker: &DockerClient,
    container_id: &str,
    spec: &InstanceSpec,
    timeout_secs: u64,
) -> Result<ValidationResult, ValidateError> {
    let timeout = std::time::Duration::from_secs(timeout_secs);
    let eval_cmd = vec!["bash".to_string(), "/root/eval.sh".to_string()];

    docker
        .write_script(container_id, "/root/eval.sh", &spec.eval_script())
        .await?;

    // ---- Step 1: pre-patch (bug-bearing commit) ----
    let pre = docker
        .exec_streamed(container_id, eval_cmd.clone(), "/testbed", timeout)
        .await?;
    if pre.timed_out {
        let mut result =
            ValidationResult::failure(format!("pre-patch eval timed out after {timeout_secs}s"));
        result.pre_raw = format!("TIMEOUT after {timeout_secs}s");
        return Ok(result);
    }

    let pre_results = match parse_log(&pre.output) {
        Some(results) => results,
        None => {
            let mut result = ValidationResult::failure("could not parse pre-patch test output");
            result.pre_raw = pre.output;
            return Ok(result);
        }
    };

    let pre_counts = classify(
        Step::PrePatch,
        &spec.fail_to_pass,
        &spec.pass_to_pass,
        &pre_results,
    );
    if let Some(reason) = step_failure_reason(Step::PrePatch, &pre_counts) {
        let mut result = ValidationResult::failure(reason);
        result.record_pre(&pre_counts);
        result.pre_raw = pre.output;
        return Ok(result);
    }

    // ---- Step 2: post-patch (gold patch applied) ----
    if spec.patch.is_empty() {
        let mut result = ValidationResult::failure("no gold patch available for step 2");
        result.record_pre(&pre_counts);
        result.pre_raw = pre.output;
        return Ok(result);
    }

    docker
        .write_script(container_id, "/tmp/gold_patch.diff", &spec.patch)
        .await?;

    let mut applied = false;
    let mut last_output = String::new();
    for attempt in APPLY_ATTEMPTS {
        let apply = docker
            .exec_with_exit(
                container_id,
                vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    format!("cd /testbed && {attempt}"),
                ],
                "/testbed",
            )
            .await?;
        last_output = apply.output;
        if apply.exit_code == 0 {
            applied = true;
            break;
        }
        debug!(instance = %spec.instance_id, attempt = %attempt, "patch attempt failed");
    }
    if !applied {
        let mut result = ValidationResult::failure(format!(
            "could not apply gold patch: {}",
            truncate(&last_output, 500)
        ));
        result.record_pre(&pre_counts);
        result.pre_raw = pre.output;
        return Ok(result);
    }

    let post = docker
        .exec_streamed(container_id, eval_cmd, "/testbed", timeout)
        .await?;
    if post.timed_out {
        let mut result =
            ValidationResult::failure(format!("post-patch eval timed out after {timeout_secs}s"));
        result.record_pre(&pre_counts);
        result.pre_raw = pre.output;
        result.post_raw = format!("TIMEOUT after {timeout_secs}s");
        return Ok(result);
    }

    let post_results = match parse_log(&post.output) {
        Some(results) => results,
        None => {
            let mut result = ValidationResult::failure("could not parse post-patch test output");
            result.record_pre(&pre_counts);
            result.pre_raw = pre.output;
            result.post_raw = post.output;
            return Ok(result);
        }
    };

    let post_counts = classify(
        Step::PostPatch,
        &spec.fail_to_pass,
        &spec.pass_to_pass,
        &post_results,
    );
    let mut result = match step_failure_reason(Step::PostPatch, &post_counts) {
        Some(reason) => ValidationResult::failure(reason),
        None => ValidationResult {
            passed: true,
            reason: "all checks passed (both pre-patch and post-patch)".to_string(),
            ..Default::default()
        },
    };
    result.record_pre(&pre_counts);
    result.record_post(&post_counts);
    result.pre_raw = pre.output;
    result.post_raw = post.output;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(pairs: &[(&str, TestStatus)]) -> HashMap<String, TestStatus> {
        pairs
            .iter()
            .map(|(id, status)| (id.to_string(), *status))
            .collect()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn framed(body: &str) -> String {
        format!("setup noise\n{START_TEST_OUTPUT}\n{body}\n{END_TEST_OUTPUT}\ntrailer\n")
    }

    #[test]
    fn test_parse_log_sentinel_region() {
        let raw = framed("PASSED t1\nFAILED t2 - boom\nERROR t3");
        let parsed = parse_log(&raw).unwrap();
        assert_eq!(parsed.get("t1"), Some(&TestStatus::Passed));
        assert_eq!(parsed.get("t2"), Some(&TestStatus::Failed));
        // ERROR normalizes to FAILED
        assert_eq!(parsed.get("t3"), Some(&TestStatus::Failed));
    }

    #[test]
    fn test_parse_log_ignores_outside_region() {
        let raw = format!(
            "PASSED outside\n{START_TEST_OUTPUT}\nPASSED inside\n{END_TEST_OUTPUT}\nFAILED after\n"
        );
        let parsed = parse_log(&raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key("inside"));
    }

    #[test]
    fn test_parse_log_fallback_marker() {
        let raw = "stuff\n== short test summary info ==\nPASSED t1\nFAILED t2\n";
        let parsed = parse_log(raw).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_log_sentinels_win_over_fallback() {
        let raw = format!(
            "{START_TEST_OUTPUT}\nPASSED sentinel_t\n{END_TEST_OUTPUT}\n\
             short test summary info\nPASSED fallback_t\n"
        );
        let parsed = parse_log(&raw).unwrap();
        assert!(parsed.contains_key("sentinel_t"));
        assert!(!parsed.contains_key("fallback_t"));
    }

    #[test]
    fn test_parse_log_no_markers_is_none() {
        assert!(parse_log("random output without any markers\nPASSED t1").is_none());
    }

    #[test]
    fn test_parse_log_empty_region_is_empty_map() {
        let raw = framed("collected 0 items");
        let parsed = parse_log(&raw).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_parse_log_strips_ansi() {
        let raw = framed("\x1b[32mPASSED\x1b[0m t1");
        let parsed = parse_log(&raw).unwrap();
        assert_eq!(parsed.get("t1"), Some(&TestStatus::Passed));
    }

    #[test]
    fn test_classify_pre_happy() {
        // scenario: t1 fails (expected bug), t2 passes (stable)
        let counts = classify(
            Step::PrePatch,
            &ids(&["t1"]),
            &ids(&["t2"]),
            &results(&[("t1", TestStatus::Failed), ("t2", TestStatus::Passed)]),
        );
        assert!(counts.clean());
        assert_eq!(counts.f2p_correct, 1);
        assert_eq!(counts.p2p_correct, 1);
        assert!(step_failure_reason(Step::PrePatch, &counts).is_none());
    }

    #[test]
    fn test_classify_pre_flaky_p2p() {
        let counts = classify(
            Step::PrePatch,
            &ids(&["t1"]),
            &ids(&["t2"]),
            &results(&[("t1", TestStatus::Failed), ("t2", TestStatus::Failed)]),
        );
        assert_eq!(counts.p2p_wrong, 1);
        let reason = step_failure_reason(Step::PrePatch, &counts).unwrap();
        assert!(reason.contains("1 P2P tests did not pass pre-patch"));
        assert!(reason.starts_with("step 1 (pre-patch) failed:"));
    }

    #[test]
    fn test_classify_pre_f2p_already_passing() {
        let counts = classify(
            Step::PrePatch,
            &ids(&["t1"]),
            &[],
            &results(&[("t1", TestStatus::Passed)]),
        );
        assert_eq!(counts.f2p_wrong, 1);
        assert!(counts.details[0].contains("unexpectedly PASSED"));
        let reason = step_failure_reason(Step::PrePatch, &counts).unwrap();
        assert!(reason.contains("1 F2P tests did not fail pre-patch"));
    }

    #[test]
    fn test_classify_missing_counts_wrong_everywhere() {
        let empty = HashMap::new();
        let pre = classify(Step::PrePatch, &ids(&["t1"]), &ids(&["t2"]), &empty);
        assert_eq!((pre.f2p_wrong, pre.p2p_wrong), (1, 1));
        let post = classify(Step::PostPatch, &ids(&["t1"]), &ids(&["t2"]), &empty);
        assert_eq!((post.f2p_wrong, post.p2p_wrong), (1, 1));
    }

    #[test]
    fn test_classify_post_incomplete_fix() {
        // scenario: fix incomplete, t1 still failing post-patch
        let counts = classify(
            Step::PostPatch,
            &ids(&["t1"]),
            &ids(&["t2"]),
            &results(&[("t1", TestStatus::Failed), ("t2", TestStatus::Passed)]),
        );
        assert_eq!(counts.f2p_wrong, 1);
        let reason = step_failure_reason(Step::PostPatch, &counts).unwrap();
        assert!(reason.contains("1 F2P tests did not pass post-patch"));
        assert!(reason.starts_with("step 2 (post-patch) failed:"));
    }

    #[test]
    fn test_counts_sum_to_expected_set_sizes() {
        let f2p = ids(&["a", "b", "c"]);
        let p2p = ids(&["d", "e"]);
        let observed = results(&[
            ("a", TestStatus::Failed),
            ("b", TestStatus::Passed),
            ("d", TestStatus::Passed),
        ]);
        for step in [Step::PrePatch, Step::PostPatch] {
            let counts = classify(step, &f2p, &p2p, &observed);
            assert_eq!(counts.f2p_correct + counts.f2p_wrong, f2p.len());
            assert_eq!(counts.p2p_correct + counts.p2p_wrong, p2p.len());
        }
    }

    #[test]
    fn test_passed_result_has_zero_wrong_counts() {
        let pre = classify(
            Step::PrePatch,
            &ids(&["t1"]),
            &ids(&["t2"]),
            &results(&[("t1", TestStatus::Failed), ("t2", TestStatus::Passed)]),
        );
        let post = classify(
            Step::PostPatch,
            &ids(&["t1"]),
            &ids(&["t2"]),
            &results(&[("t1", TestStatus::Passed), ("t2", TestStatus::Passed)]),
        );
        assert!(pre.clean() && post.clean());

        let mut result = ValidationResult {
            passed: true,
            reason: "all checks passed (both pre-patch and post-patch)".to_string(),
            ..Default::default()
        };
        result.record_pre(&pre);
        result.record_post(&post);
        assert_eq!(result.pre_f2p_wrong, 0);
        assert_eq!(result.pre_p2p_wrong, 0);
        assert_eq!(result.post_f2p_wrong, 0);
        assert_eq!(result.post_p2p_wrong, 0);
    }

    #[test]
    fn test_apply_attempts_order() {
        assert_eq!(APPLY_ATTEMPTS.len(), 3);
        assert!(APPLY_ATTEMPTS[0].starts_with("git apply -v /tmp"));
        assert!(APPLY_ATTEMPTS[1].contains("--reject"));
        assert!(APPLY_ATTEMPTS[2].starts_with("patch --batch --fuzz=5"));
    }

    #[test]
    fn test_detailed_log_bounds_raw_output() {
        let result = ValidationResult {
            pre_raw: "x".repeat(5000),
            post_raw: "y".repeat(100),
            ..Default::default()
        };
        let log = result.detailed_log();
        let pre_section = log
            .split("--- Pre-patch raw output ---")
            .nth(1)
            .unwrap()
            .split("--- Post-patch raw output ---")
            .next()
            .unwrap();
        assert!(pre_section.trim().len() <= 2000);
        assert!(log.contains(&"y".repeat(100)));
    }

    #[test]
    fn test_summary_format() {
        let mut result = ValidationResult::failure("step 1 (pre-patch) failed: 1 P2P tests did not pass pre-patch");
        result.pre_f2p_correct = 1;
        result.pre_p2p_wrong = 1;
        let summary = result.summary();
        assert!(summary.starts_with("[FAIL]"));
        assert!(summary.contains("pre(F2P_fail=1"));
        assert!(summary.contains("| step 1 (pre-patch) failed"));
    }
}
