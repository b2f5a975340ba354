//! ssh executor tests against a stand-in ssh binary

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use pushdeploy::deploy::cancel::CancelSignal;
use pushdeploy::deploy::credentials::{AuthToken, StaticCredentials};
use pushdeploy::deploy::executor::{RemoteExecutor, SshExecutor, SshOptions};
use pushdeploy::deploy::step_runner::StepRunner;
use pushdeploy::errors::DeployError;
use pushdeploy::filesys::dir::Dir;
use pushdeploy::models::run::{StepPhase, StepStatus};

use crate::common::{step, web_host};

/// Writes a fake `ssh` that runs `body` with the original arguments in "$@"
async fn fake_ssh(dir: &Dir, body: &str) -> String {
    let file = dir.file("ssh");
    file.write_atomic(format!("#!/bin/sh\n{}\n", body).as_bytes())
        .await
        .unwrap();
    let path = file.path().to_path_buf();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

fn executor(binary: String) -> SshExecutor {
    let credentials =
        StaticCredentials::new().with("web-1", AuthToken::new("/keys/web-1_ed25519"));
    SshExecutor::new(
        SshOptions {
            binary,
            extra_options: vec!["StrictHostKeyChecking=accept-new".to_string()],
        },
        Arc::new(credentials),
    )
}

#[tokio::test]
async fn test_arguments_and_output() {
    let dir = Dir::create_temp_dir("pushdeploy-ssh").await.unwrap();
    let binary = fake_ssh(&dir, r#"echo "$@""#).await;

    let output = executor(binary)
        .execute(&web_host(), "systemctl restart api", Duration::from_secs(5))
        .await
        .unwrap();

    assert!(output.success());
    assert!(output.stdout.contains("BatchMode=yes"));
    assert!(output.stdout.contains("StrictHostKeyChecking=accept-new"));
    assert!(output.stdout.contains("-i /keys/web-1_ed25519"));
    assert!(output.stdout.contains("deploy@10.0.0.5 -- systemctl restart api"));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_remote_exit_code_is_returned() {
    let dir = Dir::create_temp_dir("pushdeploy-ssh").await.unwrap();
    let binary = fake_ssh(&dir, "echo 'migration failed' >&2; exit 4").await;

    let output = executor(binary)
        .execute(&web_host(), "migrate", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(output.exit_code, 4);
    assert!(output.stderr.contains("migration failed"));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_client_failures_are_classified() {
    let dir = Dir::create_temp_dir("pushdeploy-ssh").await.unwrap();

    let binary = fake_ssh(&dir, "echo 'Permission denied (publickey).' >&2; exit 255").await;
    let err = executor(binary)
        .execute(&web_host(), "true", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::AuthError(_)));

    let binary = fake_ssh(
        &dir,
        "echo 'ssh: connect to host 10.0.0.5 port 22: Connection refused' >&2; exit 255",
    )
    .await;
    let err = executor(binary)
        .execute(&web_host(), "true", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_transient());

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_remote_exit_255_runs_once() {
    let dir = Dir::create_temp_dir("pushdeploy-ssh").await.unwrap();
    let counter = dir.file("invocations");
    let binary = fake_ssh(
        &dir,
        &format!(
            "echo run >> '{}'; echo 'migration aborted: duplicate column' >&2; exit 255",
            counter.path().display()
        ),
    )
    .await;

    let runner = StepRunner::new(Arc::new(executor(binary)), Duration::from_secs(5));
    let outcome = runner
        .run(
            &step("migrate"),
            StepPhase::Forward,
            Some("migrate forward"),
            &web_host(),
            &CancelSignal::never(),
        )
        .await;

    assert_eq!(outcome.status, StepStatus::Failed);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.exit_code, Some(255));
    assert!(outcome.stderr.contains("duplicate column"));
    let invocations = counter.read_string().await.unwrap();
    assert_eq!(invocations.lines().count(), 1);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let dir = Dir::create_temp_dir("pushdeploy-ssh").await.unwrap();
    let binary = fake_ssh(&dir, "exec sleep 5").await;

    let err = executor(binary)
        .execute(&web_host(), "true", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::TimeoutError(_)));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_missing_credential_is_auth_error() {
    let dir = Dir::create_temp_dir("pushdeploy-ssh").await.unwrap();
    let binary = fake_ssh(&dir, "exit 0").await;
    let executor = SshExecutor::new(
        SshOptions {
            binary,
            extra_options: Vec::new(),
        },
        Arc::new(StaticCredentials::new()),
    );

    let err = executor
        .execute(&web_host(), "true", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::AuthError(_)));

    dir.delete().await.unwrap();
}
