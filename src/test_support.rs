//! Shared fixtures for in-crate tests.

use std::io;

use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;

use crate::driver::{CommandOutput, CommandRunner};

/// Serve `router` on an ephemeral loopback port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// A base URL nothing listens on.
pub fn unreachable_base() -> String {
    "http://127.0.0.1:1".to_string()
}

/// Host runner that succeeds without output and runs nothing.
pub struct SilentRunner;

#[async_trait]
impl CommandRunner for SilentRunner {
    async fn run(&self, _program: &str, _args: &[&str], _stdin: Option<&str>) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            ..CommandOutput::default()
        })
    }
}
