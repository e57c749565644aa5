//! The immutable per-instance build/validation unit.
//!
//! An [`InstanceSpec`] is resolved once from a raw dataset record plus the
//! static tables, then shared read-only between the builder and the
//! validator. All image keys are derived here: the base key is
//! architecture-only, the env key is content-addressed over the env setup
//! commands, and the instance key is pinned to the bug-bearing commit.

use sha2::{Digest, Sha256};

use crate::dataset::RawInstance;
use crate::error::SpecError;
use crate::tables::{
    merged_docker_specs, repo_short_name, repo_version_spec, RepoVersionSpec, USE_X86,
};
use crate::templates::{
    dockerfile_base, dockerfile_env, dockerfile_instance, env_script, env_script_commands,
    eval_script, repo_script, EnvManifest, ManifestFetcher,
};

/// Target architecture for an instance's image stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }

    /// Docker platform string for builds and container creation.
    pub fn platform(&self) -> &'static str {
        match self {
            Arch::X86_64 => "linux/x86_64",
            Arch::Arm64 => "linux/arm64/v8",
        }
    }
}

/// Pick the architecture for an instance given the host machine arch.
///
/// arm64 hosts build arm64 images unless the instance is in the x86-only
/// override set; everything else builds x86_64.
pub fn arch_for(host_arch: &str, instance_id: &str) -> Arch {
    if matches!(host_arch, "aarch64" | "arm64") && !USE_X86.contains(&instance_id) {
        Arch::Arm64
    } else {
        Arch::X86_64
    }
}

/// Everything needed to build and validate one benchmark instance.
#[derive(Debug)]
pub struct InstanceSpec {
    pub instance_id: String,
    pub repo: String,
    pub version: String,
    pub base_commit: String,
    pub test_patch: String,
    /// Gold patch; empty when the dataset carries none.
    pub patch: String,
    pub fail_to_pass: Vec<String>,
    pub pass_to_pass: Vec<String>,

    /// Registry prefix, normalized to end with `/` (or empty).
    pub registry: String,
    pub short_name: &'static str,
    pub spec: &'static RepoVersionSpec,
    pub arch: Arch,
    /// setup_env.sh commands in order; the env image key hashes these.
    pub env_cmds: Vec<String>,
}

impl InstanceSpec {
    /// Resolve a raw record, fetching the dependency manifest when the
    /// repo-version spec calls for one.
    pub async fn resolve(
        raw: RawInstance,
        registry: &str,
        fetcher: &ManifestFetcher,
    ) -> Result<Self, SpecError> {
        let spec = lookup_spec(&raw)?;
        let setup_commit = raw
            .environment_setup_commit
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| raw.base_commit.clone());

        let manifest = match spec.packages {
            "requirements.txt" => {
                EnvManifest::Requirements(fetcher.requirements(&raw.repo, &setup_commit).await?)
            }
            "environment.yml" => EnvManifest::EnvironmentYml(
                fetcher
                    .environment_yml(&raw.repo, &setup_commit, "testbed")
                    .await?,
            ),
            _ => EnvManifest::None,
        };

        Self::from_record(raw, registry, manifest)
    }

    /// Build a spec from a record plus an already-resolved manifest.
    pub fn from_record(
        raw: RawInstance,
        registry: &str,
        manifest: EnvManifest,
    ) -> Result<Self, SpecError> {
        let spec = lookup_spec(&raw)?;
        let short_name =
            repo_short_name(&raw.repo).ok_or_else(|| SpecError::UnknownRepo(raw.repo.clone()))?;

        if let Some(overlap) = raw
            .fail_to_pass
            .iter()
            .find(|t| raw.pass_to_pass.contains(t))
        {
            return Err(SpecError::InvalidTestList(format!(
                "test '{overlap}' appears in both FAIL_TO_PASS and PASS_TO_PASS"
            )));
        }

        let registry = if registry.is_empty() {
            String::new()
        } else {
            format!("{}/", registry.trim_end_matches('/'))
        };

        let arch = arch_for(std::env::consts::ARCH, &raw.instance_id);
        let env_cmds = env_script_commands(spec, &manifest);

        Ok(Self {
            instance_id: raw.instance_id,
            repo: raw.repo,
            version: raw.version,
            base_commit: raw.base_commit,
            test_patch: raw.test_patch,
            patch: raw.patch,
            fail_to_pass: raw.fail_to_pass,
            pass_to_pass: raw.pass_to_pass,
            registry,
            short_name,
            spec,
            arch,
            env_cmds,
        })
    }

    pub fn platform(&self) -> &'static str {
        self.arch.platform()
    }

    /// `base.py.{arch}:latest` — one per architecture.
    pub fn base_image_key(&self) -> String {
        format!("base.py.{}:latest", self.arch.as_str())
    }

    /// `{registry}{short}_base:{hash22}` — content-addressed over the env
    /// command list, the docker-spec overrides, and the architecture.
    /// Equal inputs produce byte-equal keys; any single-character change
    /// in any command produces a different key.
    pub fn env_image_key(&self) -> String {
        let mut hash_input = py_list_repr(&self.env_cmds);
        if !self.spec.docker_specs.is_empty() {
            hash_input.push_str(&py_dict_repr(self.spec.docker_specs));
        }
        hash_input.push_str(self.arch.as_str());

        let digest = Sha256::digest(hash_input.as_bytes());
        let h = &hex::encode(digest)[..22];
        format!("{}{}_base:{}", self.registry, self.short_name, h)
    }

    /// `{registry}{short}_final:{base_commit}` — one per instance.
    pub fn instance_image_key(&self) -> String {
        format!(
            "{}{}_final:{}",
            self.registry, self.short_name, self.base_commit
        )
    }

    pub fn setup_env_script(&self) -> String {
        env_script(&self.env_cmds)
    }

    pub fn setup_repo_script(&self) -> String {
        repo_script(self.spec, &self.repo, &self.base_commit)
    }

    pub fn eval_script(&self) -> String {
        eval_script(self.spec, &self.repo, &self.base_commit, &self.test_patch)
    }

    pub fn base_dockerfile(&self) -> String {
        let merged = merged_docker_specs(self.spec.docker_specs);
        dockerfile_base(self.platform(), self.arch.as_str(), &merged)
    }

    pub fn env_dockerfile(&self) -> String {
        dockerfile_env(self.platform(), &self.base_image_key())
    }

    pub fn instance_dockerfile(&self) -> String {
        dockerfile_instance(self.platform(), &self.env_image_key())
    }
}

fn lookup_spec(raw: &RawInstance) -> Result<&'static RepoVersionSpec, SpecError> {
    if raw.instance_id.is_empty() {
        return Err(SpecError::MissingField("instance_id"));
    }
    if raw.base_commit.is_empty() {
        return Err(SpecError::MissingField("base_commit"));
    }
    if raw.repo.is_empty() {
        return Err(SpecError::MissingField("repo"));
    }
    if !crate::tables::known_repo(&raw.repo) {
        return Err(SpecError::UnknownRepo(raw.repo.clone()));
    }
    repo_version_spec(&raw.repo, &raw.version).ok_or_else(|| SpecError::UnknownVersion {
        repo: raw.repo.clone(),
        version: raw.version.clone(),
    })
}

/// Render a string the way Python's `repr` does for typical script text:
/// single-quoted with `\\`, `\'`, `\n`, `\r`, `\t` escapes. The env key
/// hash feeds on this rendering, keeping keys stable across rebuilds.
fn py_str_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn py_list_repr(items: &[String]) -> String {
    let rendered: Vec<String> = items.iter().map(|s| py_str_repr(s)).collect();
    format!("[{}]", rendered.join(", "))
}

fn py_dict_repr(pairs: &[(&str, &str)]) -> String {
    let rendered: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}: {}", py_str_repr(k), py_str_repr(v)))
        .collect();
    format!("{{{}}}", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::EnvManifest;

    fn raw(instance_id: &str) -> RawInstance {
        serde_json::from_value(serde_json::json!({
            "instance_id": instance_id,
            "repo": "sympy/sympy",
            "version": "1.12",
            "base_commit": "0123456789abcdef0123456789abcdef01234567",
            "test_patch": "diff --git a/sympy/core/tests/test_basic.py b/sympy/core/tests/test_basic.py\n",
            "patch": "diff --git a/sympy/core/basic.py b/sympy/core/basic.py\n",
            "FAIL_TO_PASS": ["test_a"],
            "PASS_TO_PASS": ["test_b"],
        }))
        .unwrap()
    }

    fn spec(instance_id: &str) -> InstanceSpec {
        InstanceSpec::from_record(raw(instance_id), "namanjain12/", EnvManifest::None).unwrap()
    }

    #[test]
    fn test_arch_for() {
        assert_eq!(arch_for("x86_64", "any"), Arch::X86_64);
        assert_eq!(arch_for("aarch64", "any"), Arch::Arm64);
        assert_eq!(arch_for("arm64", "any"), Arch::Arm64);
        // x86-only override forces x86_64 even on arm hosts
        assert_eq!(arch_for("aarch64", "sympy__sympy-20590"), Arch::X86_64);
    }

    #[test]
    fn test_image_keys_shape() {
        let s = spec("sympy__sympy-12345");
        assert!(s.base_image_key().starts_with("base.py."));
        assert!(s.base_image_key().ends_with(":latest"));
        let env_key = s.env_image_key();
        assert!(env_key.starts_with("namanjain12/sympy_base:"));
        let tag = env_key.rsplit(':').next().unwrap();
        assert_eq!(tag.len(), 22);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            s.instance_image_key(),
            "namanjain12/sympy_final:0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_env_key_deterministic() {
        let a = spec("sympy__sympy-1");
        let b = spec("sympy__sympy-2");
        // different instances, same env command list => byte-equal env key
        assert_eq!(a.env_image_key(), b.env_image_key());
    }

    #[test]
    fn test_env_key_sensitive_to_single_char() {
        let a = spec("sympy__sympy-1");
        let mut b = spec("sympy__sympy-2");
        let last = b.env_cmds.len() - 1;
        b.env_cmds[last].push('x');
        assert_ne!(a.env_image_key(), b.env_image_key());
    }

    #[test]
    fn test_env_key_sensitive_to_order() {
        let a = spec("sympy__sympy-1");
        let mut b = spec("sympy__sympy-2");
        b.env_cmds.swap(0, 1);
        assert_ne!(a.env_image_key(), b.env_image_key());
    }

    #[test]
    fn test_env_key_sensitive_to_arch() {
        let a = spec("sympy__sympy-1");
        let mut b = spec("sympy__sympy-2");
        b.arch = if a.arch == Arch::X86_64 { Arch::Arm64 } else { Arch::X86_64 };
        assert_ne!(a.env_image_key(), b.env_image_key());
    }

    #[test]
    fn test_registry_normalization() {
        let no_slash =
            InstanceSpec::from_record(raw("i"), "ghcr.io/org", EnvManifest::None).unwrap();
        assert!(no_slash.env_image_key().starts_with("ghcr.io/org/sympy_base:"));
        let empty = InstanceSpec::from_record(raw("i"), "", EnvManifest::None).unwrap();
        assert!(empty.env_image_key().starts_with("sympy_base:"));
    }

    #[test]
    fn test_overlapping_test_sets_rejected() {
        let mut r = raw("i");
        r.pass_to_pass = vec!["test_a".to_string()];
        let err = InstanceSpec::from_record(r, "", EnvManifest::None).unwrap_err();
        assert!(matches!(err, SpecError::InvalidTestList(_)));
    }

    #[test]
    fn test_unknown_repo_and_version() {
        let mut r = raw("i");
        r.repo = "unknown/repo".to_string();
        assert!(matches!(
            InstanceSpec::from_record(r, "", EnvManifest::None).unwrap_err(),
            SpecError::UnknownRepo(_)
        ));

        let mut r = raw("i");
        r.version = "0.0".to_string();
        assert!(matches!(
            InstanceSpec::from_record(r, "", EnvManifest::None).unwrap_err(),
            SpecError::UnknownVersion { .. }
        ));
    }

    #[test]
    fn test_missing_fields() {
        let mut r = raw("i");
        r.base_commit = String::new();
        assert!(matches!(
            InstanceSpec::from_record(r, "", EnvManifest::None).unwrap_err(),
            SpecError::MissingField("base_commit")
        ));
    }

    #[test]
    fn test_py_repr_helpers() {
        assert_eq!(py_str_repr("plain"), "'plain'");
        assert_eq!(py_str_repr("a'b"), r"'a\'b'");
        assert_eq!(py_str_repr("a\nb"), r"'a\nb'");
        assert_eq!(
            py_list_repr(&["a".to_string(), "b".to_string()]),
            "['a', 'b']"
        );
        assert_eq!(py_dict_repr(&[("k", "v")]), "{'k': 'v'}");
    }

    #[test]
    fn test_scripts_from_spec() {
        let s = spec("sympy__sympy-1");
        assert!(s.setup_env_script().contains("conda create -n testbed python=3.9 mpmath flake8 -y"));
        assert!(s.setup_repo_script().contains("git reset --hard 0123456789abcdef0123456789abcdef01234567"));
        assert!(s.eval_script().contains(">>>>> Start Test Output"));
        assert!(s.env_dockerfile().contains(&s.base_image_key()));
        assert!(s.instance_dockerfile().contains(&s.env_image_key()));
    }
}
