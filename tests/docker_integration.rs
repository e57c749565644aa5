//! Integration tests against a live Docker daemon.
//!
//! These tests build tiny images and run real containers.
//! Run with: cargo test --test docker_integration -- --ignored

use std::time::Duration;

use swe_kiln::docker::DockerClient;

fn client() -> DockerClient {
    DockerClient::connect().expect("Docker daemon must be reachable for integration tests")
}

const TEST_IMAGE: &str = "swe-kiln-it:latest";

#[tokio::test]
#[ignore] // Run with: cargo test --test docker_integration -- --ignored
async fn test_build_inspect_remove_image() {
    let docker = client();

    let context = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        context.path().join("Dockerfile"),
        "FROM busybox\nRUN echo baked > /etc/kiln-marker\n",
    )
    .expect("write Dockerfile");

    let log = docker
        .build_image(TEST_IMAGE, context.path(), "linux/x86_64", true)
        .await
        .expect("build should succeed");
    assert!(!log.is_empty(), "build log should capture streamed output");

    assert!(docker.image_exists(TEST_IMAGE).await);
    assert!(docker.remove_image(TEST_IMAGE).await);
    assert!(!docker.image_exists(TEST_IMAGE).await);
}

#[tokio::test]
#[ignore]
async fn test_build_failure_attaches_partial_log() {
    let docker = client();

    let context = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        context.path().join("Dockerfile"),
        "FROM busybox\nRUN echo before-failure\nRUN exit 7\n",
    )
    .expect("write Dockerfile");

    let err = docker
        .build_image("swe-kiln-it-fail:latest", context.path(), "linux/x86_64", true)
        .await
        .expect_err("build must fail");
    match err {
        swe_kiln::BuildError::Failed { build_log, .. } => {
            assert!(build_log.contains("before-failure"));
        }
        other => panic!("unexpected error kind: {other}"),
    }
}

#[tokio::test]
#[ignore]
async fn test_container_exec_roundtrip() {
    let docker = client();

    let id = docker
        .create_idle_container("swe-kiln-it-exec", "busybox", "linux/x86_64")
        .await
        .expect("create container");
    docker.start_container(&id).await.expect("start container");

    // scripts with shell metacharacters survive the heredoc writer verbatim
    let script = "#!/bin/sh\necho \"quoted $VAR\" 'single' `tick`\n";
    docker
        .write_script(&id, "/tmp/probe.sh", script)
        .await
        .expect("write script");
    let read_back = docker
        .exec_with_exit(
            &id,
            vec!["cat".to_string(), "/tmp/probe.sh".to_string()],
            "/",
        )
        .await
        .expect("read script back");
    assert_eq!(read_back.output, script);

    let failing = docker
        .exec_with_exit(
            &id,
            vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            "/",
        )
        .await
        .expect("exec");
    assert_eq!(failing.exit_code, 3);

    let timed = docker
        .exec_streamed(
            &id,
            vec!["sleep".to_string(), "60".to_string()],
            "/",
            Duration::from_secs(1),
        )
        .await
        .expect("exec");
    assert!(timed.timed_out);

    // cleanup is idempotent
    docker.cleanup_container(&id).await;
    docker.cleanup_container(&id).await;
}
