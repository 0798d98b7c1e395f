//! Full runs against a real Chromium. The chain fork is a stand-in script
//! plus an in-process JSON-RPC endpoint, so no `anvil` is needed.
//!
//! Run with `cargo test -p storycheck-interpreter -- --ignored`.

use async_trait::async_trait;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use storycheck_common::{Result, StoryCheckConfig};
use storycheck_interpreter::geometry::NormalizedPoint;
use storycheck_interpreter::{Grounding, LazyGrounding, StoryPaths, StoryRunner, UiGrounding};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn in_path(bin: &str) -> bool {
    Command::new("sh")
        .arg("-lc")
        .arg(format!("command -v {bin} >/dev/null 2>&1"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

const PAGE: &str = r#"<!doctype html>
<html><body style="height: 3000px">
<input id="amount" autofocus>
<button id="connect" style="position: fixed; top: 0; left: 0; width: 100%; height: 40%">Connect Wallet</button>
<script>
  document.getElementById("amount").addEventListener("keydown", (e) => {
    if (e.key === "Enter") document.title = "submitted";
  });
</script>
</body></html>"#;

/// Serves PAGE for every request
async fn serve_page() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    PAGE.len(),
                    PAGE
                );
                let _ = socket.write_all(resp.as_bytes()).await;
            });
        }
    });
    url
}

fn has_chromium() -> bool {
    ["chromium", "chromium-browser", "google-chrome"].iter().any(|b| in_path(b))
}

/// Answers every request, preflights included, with a JSON-RPC result
async fn serve_rpc(listener: TcpListener) {
    while let Ok((mut socket, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let body = r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 access-control-allow-origin: *\r\naccess-control-allow-headers: *\r\n\
                 access-control-allow-methods: POST, OPTIONS\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(resp.as_bytes()).await;
        });
    }
}

#[cfg(unix)]
fn stand_in_fork(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("anvil");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 120\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Points every expression at the upper middle of the page
struct UpperMiddle;

#[async_trait]
impl UiGrounding for UpperMiddle {
    async fn locate(&self, _image: &DynamicImage, _expression: &str) -> Result<Grounding> {
        Ok(Grounding {
            point: NormalizedPoint::new(0.5, 0.2),
            annotated: None,
        })
    }
}

#[cfg(unix)]
#[tokio::test]
#[ignore]
async fn chain_story_matches_its_snapshot_on_second_run() {
    if !has_chromium() {
        eprintln!("Skipping: no Chromium in PATH");
        return;
    }

    let url = serve_page().await;
    let rpc = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = rpc.local_addr().unwrap().port();
    tokio::spawn(serve_rpc(rpc));

    let dir = tempfile::tempdir().unwrap();
    let story_dir = dir.path().join("connect_wallet");
    std::fs::create_dir(&story_dir).unwrap();
    std::fs::write(
        story_dir.join("story.md"),
        format!(
            "## Prerequisites\n\n- Chain: id:1, block:18000000\n\n\
             ## User Steps\n\n1. Browse to {url}\n2. Click on Connect Wallet\n\n\
             ## Expected Results\n\n- Match snapshot\n"
        ),
    )
    .unwrap();

    let mut config = StoryCheckConfig::default();
    config.fork.binary = stand_in_fork(dir.path()).to_string_lossy().to_string();
    config.fork.port = port;
    config.fork.ready_timeout_secs = 5;
    config.fork.poll_interval_ms = 50;
    config.fork.chains.insert("1".into(), "http://127.0.0.1:1/mainnet".into());
    config.browser.no_sandbox = true;
    config.browser.settle_delay_ms = 100;

    let paths = StoryPaths::from_story_dir(&story_dir, &dir.path().join("results")).unwrap();
    for run in 1..=2 {
        let runner = StoryRunner::new(config.clone(), Arc::new(UpperMiddle));
        let report = runner.run(&paths).await;
        assert!(report.passed, "run {}: {:?}", run, report.errors);
        assert!(story_dir.join("story.snapshot.json").exists());
    }
    let manifest = std::fs::read_to_string(paths.results_dir.join("manifest.json")).unwrap();
    assert!(manifest.contains(&format!("127.0.0.1:{}", port)));
}

#[tokio::test]
#[ignore]
async fn story_without_chain_runs_in_browser() {
    if !has_chromium() {
        eprintln!("Skipping: no Chromium in PATH");
        return;
    }

    let url = serve_page().await;
    let dir = tempfile::tempdir().unwrap();
    let story_dir = dir.path().join("local_page");
    std::fs::create_dir(&story_dir).unwrap();
    std::fs::write(
        story_dir.join("story.md"),
        format!(
            "## User Steps\n\n1. Browse to {url}\n2. Type \"42\"\n3. Press Enter\n4. Scroll to the bottom\n\n\
             ## Expected Results\n\n- Transactions match snapshot\n"
        ),
    )
    .unwrap();

    let mut config = StoryCheckConfig::default();
    config.browser.no_sandbox = true;
    config.browser.settle_delay_ms = 100;
    let runner = StoryRunner::new(config.clone(), Arc::new(LazyGrounding::new(config.grounding)));

    let paths = StoryPaths::from_story_dir(&story_dir, &dir.path().join("results")).unwrap();
    let report = runner.run(&paths).await;

    assert!(report.passed, "{:?}", report.errors);
    let results = &paths.results_dir;
    for file in ["result.json", "manifest.json", "tx_log_snapshot.json", "trace.zip", "final.png"] {
        assert!(results.join(file).exists(), "missing {}", file);
    }
    assert!(story_dir.join("story.snapshot.json").exists());
}
