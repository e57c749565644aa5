//! Shell script generation for env setup, repo setup, and eval runs.

use std::sync::OnceLock;

use regex::Regex;

use crate::tables::{RepoVersionSpec, END_TEST_OUTPUT, NON_TEST_EXTS, START_TEST_OUTPUT};

/// Heredoc delimiter for embedding dependency manifests in setup_env.sh.
const ENV_HEREDOC: &str = "EOF_59812759871";

/// Heredoc delimiter for embedding the test patch in eval.sh.
const EVAL_HEREDOC: &str = "EOF_114329324912";

/// Conda environment name used throughout the image tiers.
const ENV_NAME: &str = "testbed";

/// Dependency manifest resolved for an instance, ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvManifest {
    /// No manifest needed (literal package list or no packages).
    None,
    /// requirements.txt content.
    Requirements(String),
    /// environment.yml content, `name:` already rewritten to `testbed`.
    EnvironmentYml(String),
}

fn diff_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"diff --git a/.* b/(.*)").unwrap())
}

/// File paths touched by a unified diff, in patch order.
pub fn modified_files(patch: &str) -> Vec<String> {
    diff_target_re()
        .captures_iter(patch)
        .map(|c| c[1].to_string())
        .collect()
}

/// Test identifiers to pass to the test runner, derived from the test patch.
///
/// Diff targets with non-test extensions are dropped. Path-loader repos
/// (django) get `tests/foo/bar.py` rewritten to `foo.bar`.
pub fn test_directives(repo: &str, test_patch: &str) -> Vec<String> {
    let mut directives: Vec<String> = modified_files(test_patch)
        .into_iter()
        .filter(|d| !NON_TEST_EXTS.iter().any(|ext| d.ends_with(ext)))
        .collect();

    if repo == "django/django" {
        directives = directives
            .into_iter()
            .map(|d| {
                let d = d.strip_suffix(".py").unwrap_or(&d).to_string();
                let d = d.strip_prefix("tests/").unwrap_or(&d).to_string();
                d.replace('/', ".")
            })
            .collect();
    }

    directives
}

/// Commands making up setup_env.sh, in execution order.
///
/// This exact list (content and order) is what the env image key hashes, so
/// any change here deliberately invalidates existing env images.
pub fn env_script_commands(spec: &RepoVersionSpec, manifest: &EnvManifest) -> Vec<String> {
    let mut cmds = vec!["source /opt/miniconda3/bin/activate".to_string()];

    match (spec.packages, manifest) {
        ("requirements.txt", EnvManifest::Requirements(reqs)) => {
            cmds.push(format!(
                "conda create -n {ENV_NAME} python={} -y",
                spec.python
            ));
            let path = "$HOME/requirements.txt";
            cmds.push(format!("cat <<'{ENV_HEREDOC}' > {path}\n{reqs}\n{ENV_HEREDOC}"));
            cmds.push(format!(
                "conda activate {ENV_NAME} && python -m pip install -r {path}"
            ));
            cmds.push(format!("rm {path}"));
        }
        ("environment.yml", EnvManifest::EnvironmentYml(yml)) => {
            let path = "environment.yml";
            cmds.push(format!("cat <<'{ENV_HEREDOC}' > {path}\n{yml}\n{ENV_HEREDOC}"));
            if spec.no_use_env {
                cmds.push(format!(
                    "conda create -c conda-forge -n {ENV_NAME} python={} -y",
                    spec.python
                ));
                cmds.push(format!("conda env update -f {path}"));
            } else {
                cmds.push(format!("conda env create --file {path}"));
                cmds.push(format!(
                    "conda activate {ENV_NAME} && conda install python={} -y",
                    spec.python
                ));
            }
            cmds.push(format!("rm {path}"));
        }
        (pkgs, _) => {
            cmds.push(format!(
                "conda create -n {ENV_NAME} python={} {pkgs} -y",
                spec.python
            ));
        }
    }

    cmds.push(format!("conda activate {ENV_NAME}"));

    if !spec.pip_packages.is_empty() {
        cmds.push(format!(
            "python -m pip install {}",
            spec.pip_packages.join(" ")
        ));
    }

    cmds
}

fn bash_script(set_flags: &str, cmds: &[String]) -> String {
    let mut lines = vec!["#!/bin/bash".to_string(), set_flags.to_string()];
    lines.extend(cmds.iter().cloned());
    lines.join("\n") + "\n"
}

/// Full setup_env.sh text.
pub fn env_script(cmds: &[String]) -> String {
    bash_script("set -euxo pipefail", cmds)
}

/// setup_repo.sh: clone, pin to the bug-bearing commit, install, and record
/// a dummy commit so later diffs are well-defined.
pub fn repo_script(spec: &RepoVersionSpec, repo: &str, base_commit: &str) -> String {
    let repo_directory = "/testbed";
    let mut cmds = vec![
        format!("git clone -o origin https://github.com/{repo} {repo_directory}"),
        format!("chmod -R 777 {repo_directory}"),
        format!("cd {repo_directory}"),
        format!("git reset --hard {base_commit}"),
        "git remote remove origin".to_string(),
        "source /opt/miniconda3/bin/activate".to_string(),
        format!("conda activate {ENV_NAME}"),
        "echo \"Current environment: $CONDA_DEFAULT_ENV\"".to_string(),
    ];

    cmds.extend(spec.pre_install.iter().map(|c| c.to_string()));
    if let Some(install) = spec.install {
        cmds.push(install.to_string());
    }

    cmds.extend([
        "git config --global user.email setup@swekiln.config".to_string(),
        "git config --global user.name swe-kiln".to_string(),
        "git commit --allow-empty -am swe-kiln".to_string(),
    ]);

    bash_script("set -euxo pipefail", &cmds)
}

/// eval.sh: reset the test files, apply the test patch, and run the test
/// command between output sentinels.
///
/// Used verbatim for both the pre-patch and post-patch steps; the gold
/// patch is applied separately between the two runs. The flag set is
/// `set -uxo pipefail` (no `-e`): the script must survive failing tests so
/// the trailing reset and the end sentinel still execute.
pub fn eval_script(
    spec: &RepoVersionSpec,
    repo: &str,
    base_commit: &str,
    test_patch: &str,
) -> String {
    let repo_directory = "/testbed";
    let test_files = modified_files(test_patch);
    let reset_tests_command = format!("git checkout {base_commit} {}", test_files.join(" "));
    let apply_test_patch_command =
        format!("git apply -v - <<'{EVAL_HEREDOC}'\n{test_patch}\n{EVAL_HEREDOC}");

    let mut test_command = spec.test_cmd.to_string();
    for directive in test_directives(repo, test_patch) {
        test_command.push(' ');
        test_command.push_str(&directive);
    }

    let mut cmds = vec![
        "source /opt/miniconda3/bin/activate".to_string(),
        format!("conda activate {ENV_NAME}"),
        format!("cd {repo_directory}"),
    ];
    cmds.extend(spec.eval_commands.iter().map(|c| c.to_string()));
    cmds.extend([
        format!("git config --global --add safe.directory {repo_directory}"),
        format!("cd {repo_directory}"),
        "git status".to_string(),
        "git show".to_string(),
        format!("git -c core.fileMode=false diff {base_commit}"),
        "source /opt/miniconda3/bin/activate".to_string(),
        format!("conda activate {ENV_NAME}"),
    ]);
    if let Some(install) = spec.install {
        cmds.push(install.to_string());
    }
    cmds.extend([
        reset_tests_command.clone(),
        apply_test_patch_command,
        format!(": '{START_TEST_OUTPUT}'"),
        test_command,
        format!(": '{END_TEST_OUTPUT}'"),
        reset_tests_command,
    ]);

    bash_script("set -uxo pipefail", &cmds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::repo_version_spec;

    const TEST_PATCH: &str = "\
diff --git a/tests/queries/test_q.py b/tests/queries/test_q.py\n\
index 111..222 100644\n\
--- a/tests/queries/test_q.py\n\
+++ b/tests/queries/test_q.py\n\
@@ -1 +1,2 @@\n\
+new line\n\
diff --git a/docs/changes.rst b/docs/changes.rst\n\
index 333..444 100644\n\
--- a/docs/changes.rst\n\
+++ b/docs/changes.rst\n\
@@ -1 +1,2 @@\n\
+doc line\n";

    #[test]
    fn test_modified_files() {
        assert_eq!(
            modified_files(TEST_PATCH),
            vec!["tests/queries/test_q.py", "docs/changes.rst"]
        );
        assert!(modified_files("no diff here").is_empty());
    }

    #[test]
    fn test_directives_drop_non_test_exts() {
        let dirs = test_directives("sympy/sympy", TEST_PATCH);
        assert_eq!(dirs, vec!["tests/queries/test_q.py"]);
    }

    #[test]
    fn test_directives_django_module_rewrite() {
        let dirs = test_directives("django/django", TEST_PATCH);
        assert_eq!(dirs, vec!["queries.test_q"]);
    }

    #[test]
    fn test_directives_all_non_test_is_empty() {
        let patch = "diff --git a/README.md b/README.md\n";
        assert!(test_directives("sympy/sympy", patch).is_empty());
    }

    #[test]
    fn test_env_commands_literal_packages() {
        let spec = repo_version_spec("sympy/sympy", "1.12").unwrap();
        let cmds = env_script_commands(spec, &EnvManifest::None);
        assert_eq!(cmds[0], "source /opt/miniconda3/bin/activate");
        assert_eq!(cmds[1], "conda create -n testbed python=3.9 mpmath flake8 -y");
        assert_eq!(cmds[2], "conda activate testbed");
        assert_eq!(cmds[3], "python -m pip install mpmath==1.3.0");
    }

    #[test]
    fn test_env_commands_requirements() {
        let spec = repo_version_spec("django/django", "4.2").unwrap();
        let manifest = EnvManifest::Requirements("pytest\nasgiref".to_string());
        let cmds = env_script_commands(spec, &manifest);
        assert!(cmds[1].starts_with("conda create -n testbed python=3.9 -y"));
        assert!(cmds[2].contains("EOF_59812759871"));
        assert!(cmds[2].contains("pytest\nasgiref"));
        assert!(cmds[3].contains("pip install -r $HOME/requirements.txt"));
        assert_eq!(cmds[4], "rm $HOME/requirements.txt");
    }

    #[test]
    fn test_env_commands_environment_yml_no_use_env() {
        let spec = repo_version_spec("pydata/xarray", "2023.07").unwrap();
        let manifest = EnvManifest::EnvironmentYml("name: testbed\ndependencies: []".to_string());
        let cmds = env_script_commands(spec, &manifest);
        assert!(cmds.iter().any(|c| c.contains("conda create -c conda-forge -n testbed")));
        assert!(cmds.iter().any(|c| c == "conda env update -f environment.yml"));
        assert!(!cmds.iter().any(|c| c.contains("conda env create")));
    }

    #[test]
    fn test_env_commands_environment_yml_create() {
        let spec = repo_version_spec("matplotlib/matplotlib", "3.7").unwrap();
        let manifest = EnvManifest::EnvironmentYml("name: testbed".to_string());
        let cmds = env_script_commands(spec, &manifest);
        assert!(cmds.iter().any(|c| c == "conda env create --file environment.yml"));
    }

    #[test]
    fn test_env_script_header() {
        let script = env_script(&["echo hi".to_string()]);
        assert!(script.starts_with("#!/bin/bash\nset -euxo pipefail\necho hi"));
        assert!(script.ends_with('\n'));
    }

    #[test]
    fn test_repo_script_contents() {
        let spec = repo_version_spec("sympy/sympy", "1.12").unwrap();
        let script = repo_script(spec, "sympy/sympy", "abc123");
        assert!(script.contains("git clone -o origin https://github.com/sympy/sympy /testbed"));
        assert!(script.contains("git reset --hard abc123"));
        assert!(script.contains("git remote remove origin"));
        assert!(script.contains("python -m pip install -e ."));
        assert!(script.contains("git commit --allow-empty"));
    }

    #[test]
    fn test_eval_script_sentinels_and_flags() {
        let spec = repo_version_spec("django/django", "4.2").unwrap();
        let script = eval_script(spec, "django/django", "abc123", TEST_PATCH);
        assert!(script.contains("set -uxo pipefail"));
        assert!(!script.contains("set -euxo pipefail"));
        assert!(script.contains(": '>>>>> Start Test Output'"));
        assert!(script.contains(": '>>>>> End Test Output'"));
        assert!(script.contains("./tests/runtests.py --verbosity 2 --settings=test_sqlite --parallel 1 queries.test_q"));
        // test files are reset both before applying the patch and at the end
        assert_eq!(
            script.matches("git checkout abc123 tests/queries/test_q.py docs/changes.rst").count(),
            2
        );
        assert!(script.contains("git apply -v - <<'EOF_114329324912'"));
    }

    #[test]
    fn test_eval_script_bare_test_cmd_on_empty_directives() {
        let spec = repo_version_spec("sympy/sympy", "1.12").unwrap();
        let patch = "diff --git a/README.md b/README.md\n";
        let script = eval_script(spec, "sympy/sympy", "abc123", patch);
        assert!(script.contains("\nbin/test -C --verbose\n"));
    }

    #[test]
    fn test_eval_directives_stable_for_identical_patches() {
        let a = test_directives("django/django", TEST_PATCH);
        let b = test_directives("django/django", TEST_PATCH);
        assert_eq!(a, b);
    }
}
