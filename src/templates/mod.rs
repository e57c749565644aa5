//! Text generation for the three-tier image builds.
//!
//! Dockerfiles and setup/eval shell scripts are pure functions from an
//! instance spec to text; dependency manifests are fetched from GitHub at
//! planning time and embedded into the env setup script.

pub mod dockerfiles;
pub mod manifests;
pub mod scripts;

pub use dockerfiles::{dockerfile_base, dockerfile_env, dockerfile_instance};
pub use manifests::ManifestFetcher;
pub use scripts::{
    env_script, env_script_commands, eval_script, modified_files, repo_script, test_directives,
    EnvManifest,
};
