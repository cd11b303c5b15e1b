#![cfg(unix)]

use std::time::Duration;

use tes_rs::shutdown::cancel_on_signal;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn sigterm_cancels_the_token() {
    let token = CancellationToken::new();
    cancel_on_signal(token.clone()).unwrap();
    assert!(!token.is_cancelled());

    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("token not cancelled after SIGTERM");
}
