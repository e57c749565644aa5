//! Static repo/version configuration tables.
//!
//! These tables are process-wide immutable data: per-repo-version install
//! specs, short image names, dependency-manifest candidate paths, and the
//! architecture override set. The build and validation core reads them and
//! never mutates them.

/// Marker printed by the eval script immediately before the test runner.
pub const START_TEST_OUTPUT: &str = ">>>>> Start Test Output";

/// Marker printed by the eval script immediately after the test runner.
pub const END_TEST_OUTPUT: &str = ">>>>> End Test Output";

/// Environment variable that overrides the default registry prefix.
pub const REGISTRY_ENV_VAR: &str = "R2E_DOCKER_REGISTRY";

/// Default registry prefix when `R2E_DOCKER_REGISTRY` is unset.
pub const DEFAULT_REGISTRY: &str = "namanjain12/";

/// Base URL for fetching raw files from GitHub.
pub const GITHUB_RAW_URL: &str = "https://raw.githubusercontent.com";

/// File extensions that never denote test files. Diff targets with these
/// suffixes are dropped when deriving test directives from a test patch.
pub const NON_TEST_EXTS: &[&str] = &[
    ".json", ".png", ".csv", ".txt", ".md", ".rst", ".jpg", ".jpeg", ".pkl", ".yml", ".yaml",
    ".toml",
];

/// Build knobs for the base Dockerfile, overridable per repo version
/// through [`RepoVersionSpec::docker_specs`].
pub const DEFAULT_DOCKER_SPECS: &[(&str, &str)] = &[
    ("ubuntu_version", "22.04"),
    ("conda_version", "py311_23.11.0-2"),
];

/// Instances that must build as `linux/x86_64` even on arm64 hosts
/// (their pinned dependency stacks have no aarch64 wheels).
pub const USE_X86: &[&str] = &[
    "sympy__sympy-20590",
    "matplotlib__matplotlib-13983",
    "matplotlib__matplotlib-13984",
    "matplotlib__matplotlib-13989",
    "scikit-learn__scikit-learn-12421",
    "astropy__astropy-7973",
];

/// One entry of the repo-version spec table.
#[derive(Debug)]
pub struct RepoVersionSpec {
    /// Python version for the conda env.
    pub python: &'static str,
    /// `"requirements.txt"`, `"environment.yml"`, or a literal
    /// space-separated conda package list (possibly empty).
    pub packages: &'static str,
    /// Extra pip packages installed after env creation.
    pub pip_packages: &'static [&'static str],
    /// Commands run before the install step during repo setup.
    pub pre_install: &'static [&'static str],
    /// The editable-install command for the repo itself.
    pub install: Option<&'static str>,
    /// Commands run at the top of every eval invocation.
    pub eval_commands: &'static [&'static str],
    /// Test runner invocation prefix; directives are appended.
    pub test_cmd: &'static str,
    /// For environment.yml repos: create the env first, then `env update`
    /// instead of `env create`.
    pub no_use_env: bool,
    /// Per-version overrides of the base-image build knobs.
    pub docker_specs: &'static [(&'static str, &'static str)],
}

impl RepoVersionSpec {
    const fn defaults() -> Self {
        Self {
            python: "3.9",
            packages: "",
            pip_packages: &[],
            pre_install: &[],
            install: None,
            eval_commands: &[],
            test_cmd: "pytest -rA",
            no_use_env: false,
            docker_specs: &[],
        }
    }
}

const DJANGO_TEST_CMD: &str =
    "./tests/runtests.py --verbosity 2 --settings=test_sqlite --parallel 1";

const DJANGO_EVAL: &[&str] = &[
    "export LANG=en_US.UTF-8 LANGUAGE=en_US:en LC_ALL=en_US.UTF-8",
];

static DJANGO_3_2: RepoVersionSpec = RepoVersionSpec {
    python: "3.6",
    packages: "requirements.txt",
    install: Some("python -m pip install -e ."),
    eval_commands: DJANGO_EVAL,
    test_cmd: DJANGO_TEST_CMD,
    ..RepoVersionSpec::defaults()
};

static DJANGO_4_0: RepoVersionSpec = RepoVersionSpec {
    python: "3.8",
    packages: "requirements.txt",
    install: Some("python -m pip install -e ."),
    eval_commands: DJANGO_EVAL,
    test_cmd: DJANGO_TEST_CMD,
    ..RepoVersionSpec::defaults()
};

static DJANGO_4_2: RepoVersionSpec = RepoVersionSpec {
    python: "3.9",
    packages: "requirements.txt",
    install: Some("python -m pip install -e ."),
    eval_commands: DJANGO_EVAL,
    test_cmd: DJANGO_TEST_CMD,
    ..RepoVersionSpec::defaults()
};

static DJANGO_5_0: RepoVersionSpec = RepoVersionSpec {
    python: "3.11",
    packages: "requirements.txt",
    install: Some("python -m pip install -e ."),
    eval_commands: DJANGO_EVAL,
    test_cmd: DJANGO_TEST_CMD,
    docker_specs: &[("ubuntu_version", "24.04")],
    ..RepoVersionSpec::defaults()
};

static SYMPY: RepoVersionSpec = RepoVersionSpec {
    python: "3.9",
    packages: "mpmath flake8",
    pip_packages: &["mpmath==1.3.0"],
    install: Some("python -m pip install -e ."),
    test_cmd: "bin/test -C --verbose",
    ..RepoVersionSpec::defaults()
};

static REQUESTS: RepoVersionSpec = RepoVersionSpec {
    python: "3.9",
    packages: "pytest",
    install: Some("python -m pip install ."),
    ..RepoVersionSpec::defaults()
};

static FLASK: RepoVersionSpec = RepoVersionSpec {
    python: "3.11",
    packages: "requirements.txt",
    install: Some("python -m pip install -e ."),
    ..RepoVersionSpec::defaults()
};

static SCIKIT_LEARN: RepoVersionSpec = RepoVersionSpec {
    python: "3.9",
    packages: "numpy scipy cython pytest pandas matplotlib joblib threadpoolctl",
    pip_packages: &["cython==0.29.32", "setuptools"],
    install: Some("python -m pip install -v --no-use-pep517 --no-build-isolation -e ."),
    ..RepoVersionSpec::defaults()
};

static MATPLOTLIB: RepoVersionSpec = RepoVersionSpec {
    python: "3.11",
    packages: "environment.yml",
    pre_install: &[
        "apt-get -y update && apt-get -y upgrade && DEBIAN_FRONTEND=noninteractive apt-get install -y imagemagick ffmpeg libfreetype6-dev pkg-config texlive texlive-latex-extra texlive-fonts-recommended texlive-xetex texlive-luatex cm-super dvipng",
    ],
    install: Some("python -m pip install -e ."),
    ..RepoVersionSpec::defaults()
};

static ASTROPY: RepoVersionSpec = RepoVersionSpec {
    python: "3.9",
    packages: "requirements.txt",
    install: Some("python -m pip install -e .[test] --verbose"),
    test_cmd: "pytest -rA -vv -o console_output_style=classic --tb=no",
    ..RepoVersionSpec::defaults()
};

static PYTEST: RepoVersionSpec = RepoVersionSpec {
    python: "3.9",
    install: Some("python -m pip install -e ."),
    ..RepoVersionSpec::defaults()
};

static XARRAY: RepoVersionSpec = RepoVersionSpec {
    python: "3.10",
    packages: "environment.yml",
    pip_packages: &["numpy==1.24.3", "pandas==2.0.3"],
    install: Some("python -m pip install -e ."),
    no_use_env: true,
    ..RepoVersionSpec::defaults()
};

/// The (`repo`, `version`) → spec table.
static REPO_VERSION_SPECS: &[(&str, &[(&str, &RepoVersionSpec)])] = &[
    (
        "django/django",
        &[
            ("3.2", &DJANGO_3_2),
            ("4.0", &DJANGO_4_0),
            ("4.1", &DJANGO_4_2),
            ("4.2", &DJANGO_4_2),
            ("5.0", &DJANGO_5_0),
        ],
    ),
    ("sympy/sympy", &[("1.11", &SYMPY), ("1.12", &SYMPY)]),
    ("psf/requests", &[("2.26", &REQUESTS), ("2.31", &REQUESTS)]),
    ("pallets/flask", &[("2.3", &FLASK)]),
    (
        "scikit-learn/scikit-learn",
        &[("1.3", &SCIKIT_LEARN), ("1.4", &SCIKIT_LEARN)],
    ),
    ("matplotlib/matplotlib", &[("3.7", &MATPLOTLIB)]),
    ("astropy/astropy", &[("5.1", &ASTROPY), ("5.2", &ASTROPY)]),
    ("pytest-dev/pytest", &[("7.4", &PYTEST), ("8.0", &PYTEST)]),
    ("pydata/xarray", &[("2023.07", &XARRAY)]),
];

/// Short image-name component per repo (`{registry}{short}_base:{hash}`).
static REPO_SHORT_NAMES: &[(&str, &str)] = &[
    ("django/django", "django"),
    ("sympy/sympy", "sympy"),
    ("psf/requests", "requests"),
    ("pallets/flask", "flask"),
    ("scikit-learn/scikit-learn", "sklearn"),
    ("matplotlib/matplotlib", "matplotlib"),
    ("astropy/astropy", "astropy"),
    ("pytest-dev/pytest", "pytest"),
    ("pydata/xarray", "xarray"),
];

/// Ordered candidate paths for requirements.txt, per repo.
static REPO_REQS_PATHS: &[(&str, &[&str])] = &[
    ("django/django", &["tests/requirements/py3.txt"]),
    ("pallets/flask", &["requirements/dev.txt", "requirements.txt"]),
    ("astropy/astropy", &["requirements.txt"]),
];

/// Ordered candidate paths for environment.yml, per repo.
static REPO_ENV_YML_PATHS: &[(&str, &[&str])] = &[
    ("matplotlib/matplotlib", &["environment.yml"]),
    (
        "pydata/xarray",
        &["ci/requirements/environment.yml", "environment.yml"],
    ),
];

/// Look up the spec for a (`repo`, `version`) pair.
pub fn repo_version_spec(repo: &str, version: &str) -> Option<&'static RepoVersionSpec> {
    REPO_VERSION_SPECS
        .iter()
        .find(|(r, _)| *r == repo)
        .and_then(|(_, versions)| versions.iter().find(|(v, _)| *v == version))
        .map(|(_, spec)| *spec)
}

/// Whether `repo` is known at all (any version).
pub fn known_repo(repo: &str) -> bool {
    REPO_VERSION_SPECS.iter().any(|(r, _)| *r == repo)
}

/// Short image-name component for a repo.
pub fn repo_short_name(repo: &str) -> Option<&'static str> {
    REPO_SHORT_NAMES
        .iter()
        .find(|(r, _)| *r == repo)
        .map(|(_, s)| *s)
}

/// Candidate requirements.txt paths for a repo, most-preferred first.
pub fn reqs_paths(repo: &str) -> &'static [&'static str] {
    REPO_REQS_PATHS
        .iter()
        .find(|(r, _)| *r == repo)
        .map(|(_, p)| *p)
        .unwrap_or(&["requirements.txt"])
}

/// Candidate environment.yml paths for a repo, most-preferred first.
pub fn env_yml_paths(repo: &str) -> &'static [&'static str] {
    REPO_ENV_YML_PATHS
        .iter()
        .find(|(r, _)| *r == repo)
        .map(|(_, p)| *p)
        .unwrap_or(&["environment.yml"])
}

/// Merge the default docker specs with a version's overrides, override wins.
pub fn merged_docker_specs(
    overrides: &'static [(&'static str, &'static str)],
) -> Vec<(&'static str, &'static str)> {
    let mut merged: Vec<(&'static str, &'static str)> = Vec::new();
    for (k, v) in DEFAULT_DOCKER_SPECS {
        let value = overrides
            .iter()
            .find(|(ok, _)| ok == k)
            .map(|(_, ov)| *ov)
            .unwrap_or(*v);
        merged.push((k, value));
    }
    for (k, v) in overrides {
        if !DEFAULT_DOCKER_SPECS.iter().any(|(dk, _)| dk == k) {
            merged.push((k, v));
        }
    }
    merged
}
