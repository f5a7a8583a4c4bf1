//! Control socket binding
//!
//! Binding must only ever replace a socket file nobody is listening on.

#![allow(clippy::expect_used, clippy::unwrap_used)]
#![cfg(unix)]

use std::os::unix::fs::FileTypeExt;
use std::sync::Arc;

use aether::error::ProtocolError;
use aether::events::bus::EventBus;
use aether::modules::ModuleRegistry;
use aether::transport::control::ControlServer;

fn server(path: &std::path::Path) -> ControlServer {
    ControlServer::new(path, Arc::new(ModuleRegistry::new(EventBus::new())))
}

#[tokio::test]
async fn test_bind_refuses_regular_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aetherd.socket");
    std::fs::write(&path, b"keep me").unwrap();

    let err = server(&path).bind().await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotASocket(_)), "unexpected error: {err}");

    // File left untouched
    let metadata = std::fs::symlink_metadata(&path).unwrap();
    assert!(metadata.file_type().is_file());
    assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
}

#[tokio::test]
async fn test_bind_refuses_live_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aetherd.socket");

    let first = server(&path).bind().await.unwrap();
    let err = server(&path).bind().await.unwrap_err();
    assert!(matches!(err, ProtocolError::SocketInUse(_)), "unexpected error: {err}");

    // The first listener still owns the path
    let client = tokio::net::UnixStream::connect(&path).await;
    assert!(client.is_ok());
    let (accepted, _) = first.accept().await.unwrap();
    drop(accepted);
}

#[tokio::test]
async fn test_bind_replaces_stale_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aetherd.socket");

    // A listener that went away without cleaning up leaves its file behind
    let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
    drop(stale);
    assert!(std::fs::symlink_metadata(&path).unwrap().file_type().is_socket());

    let listener = server(&path).bind().await.unwrap();
    let client = tokio::net::UnixStream::connect(&path).await;
    assert!(client.is_ok());
    drop(listener);
}

#[tokio::test]
async fn test_bind_fresh_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aetherd.socket");

    let _listener = server(&path).bind().await.unwrap();
    assert!(std::fs::symlink_metadata(&path).unwrap().file_type().is_socket());
}
