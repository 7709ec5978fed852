//! Docker backend tests. They need a running Docker daemon and the kernel
//! image, so they are ignored by default:
//!
//! ```text
//! cargo test -p codebox_sandbox --test docker_backend_test -- --ignored
//! ```

use codebox_sandbox::{CodeBox, CodeBoxConfig, Error, HealthStatus, KernelMode, SessionState};

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_container_session_lifecycle() {
    let codebox = CodeBox::new(CodeBoxConfig::docker()).unwrap();

    let result = codebox.execute("print(6 * 7)", KernelMode::Python).await.unwrap();
    assert_eq!(result.text().trim(), "42");

    codebox.upload("data.txt", "inside the container").await.unwrap();
    let file = codebox.download("data.txt").await.unwrap();
    assert_eq!(&file.content().await.unwrap()[..], b"inside the container");

    let resumed = CodeBox::resume(codebox.session_id(), CodeBoxConfig::docker())
        .await
        .unwrap();
    assert_eq!(resumed.healthcheck().await, HealthStatus::Healthy);

    codebox.stop().await.unwrap();
    assert_eq!(codebox.state(), SessionState::Stopped);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_resume_missing_container() {
    let err = CodeBox::resume("codebox-does-not-exist", CodeBoxConfig::docker())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::SessionNotFound(_)));
}
