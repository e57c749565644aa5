//! Dockerfile templates for the base → env → instance image tiers.

/// Value for `key` in a merged docker-specs list, with a hard fallback so a
/// malformed table entry cannot produce an unbuildable Dockerfile.
fn spec_value<'a>(specs: &'a [(&str, &str)], key: &str, fallback: &'a str) -> &'a str {
    specs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .unwrap_or(fallback)
}

/// Base tier: Ubuntu + toolchain + Miniconda + a nonroot user.
///
/// One base image exists per architecture; every env image builds on top.
pub fn dockerfile_base(platform: &str, arch: &str, docker_specs: &[(&str, &str)]) -> String {
    let ubuntu_version = spec_value(docker_specs, "ubuntu_version", "22.04");
    let conda_version = spec_value(docker_specs, "conda_version", "py311_23.11.0-2");
    let conda_arch = if arch == "arm64" { "aarch64" } else { arch };

    format!(
        r#"
FROM --platform={platform} ubuntu:{ubuntu_version}

ARG DEBIAN_FRONTEND=noninteractive
ENV TZ=Etc/UTC

RUN apt update && apt install -y \
wget \
git \
build-essential \
libffi-dev \
libtiff-dev \
python3 \
python3-pip \
python-is-python3 \
jq \
curl \
locales \
locales-all \
tzdata \
&& rm -rf /var/lib/apt/lists/*

# Download and install conda
RUN wget 'https://repo.anaconda.com/miniconda/Miniconda3-{conda_version}-Linux-{conda_arch}.sh' -O miniconda.sh \
    && bash miniconda.sh -b -p /opt/miniconda3
# Add conda to PATH
ENV PATH=/opt/miniconda3/bin:$PATH
# Add conda to shell startup scripts like .bashrc (DO NOT REMOVE THIS)
RUN conda init --all
RUN conda config --append channels conda-forge

RUN adduser --disabled-password --gecos 'dog' nonroot
"#
    )
}

/// Env tier: run the generated `setup_env.sh` on top of the base image and
/// make the `testbed` conda env the login default.
pub fn dockerfile_env(platform: &str, base_image_key: &str) -> String {
    format!(
        r#"FROM --platform={platform} {base_image_key}

COPY ./setup_env.sh /root/
RUN sed -i -e 's/\r$//' /root/setup_env.sh
RUN chmod +x /root/setup_env.sh
RUN /bin/bash -c "source ~/.bashrc && /root/setup_env.sh"

WORKDIR /testbed/

# Automatically activate the testbed environment
RUN echo "source /opt/miniconda3/etc/profile.d/conda.sh && conda activate testbed" > /root/.bashrc
"#
    )
}

/// Instance tier: clone + checkout + install via the generated
/// `setup_repo.sh`, one image per base commit.
pub fn dockerfile_instance(platform: &str, env_image_key: &str) -> String {
    format!(
        r#"FROM --platform={platform} {env_image_key}

COPY ./setup_repo.sh /root/
RUN sed -i -e 's/\r$//' /root/setup_repo.sh
RUN /bin/bash /root/setup_repo.sh

WORKDIR /testbed/
"#
    )
}
