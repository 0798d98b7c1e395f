//! Fork process management
//!
//! Launches the local fork binary, drains its output into the log, waits for
//! it to answer JSON-RPC, and tears it down with SIGTERM then SIGKILL.

use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use storycheck_common::{ChainEndpoints, ForkConfig, Result, StoryError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::ChainFork;

/// Shortest wait for one readiness check, even past the deadline
const MIN_CHECK_BUDGET: Duration = Duration::from_millis(100);

/// Fork lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl fmt::Display for ForkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForkState::Stopped => "stopped",
            ForkState::Starting => "starting",
            ForkState::Ready => "ready",
            ForkState::Stopping => "stopping",
            ForkState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to fork
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkRequest {
    pub chain_id: String,
    pub block_number: Option<String>,
    /// Overrides the configured RPC URL for the chain
    pub rpc_url: Option<String>,
}

impl ForkRequest {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            ..Default::default()
        }
    }

    pub fn at_block(mut self, block: impl Into<String>) -> Self {
        self.block_number = Some(block.into());
        self
    }
}

/// A launched fork
#[derive(Debug, Clone)]
pub struct ForkHandle {
    pub chain_id: String,
    pub block_number: Option<String>,
    pub remote_rpc_url: String,
    pub local_rpc_url: String,
    pub pid: Option<u32>,
    pub ready_deadline: Instant,
}

impl ForkHandle {
    pub fn endpoints(&self) -> ChainEndpoints {
        ChainEndpoints {
            chain_id: self.chain_id.clone(),
            remote_rpc_url: self.remote_rpc_url.clone(),
            local_rpc_url: self.local_rpc_url.clone(),
        }
    }
}

struct ForkInner {
    state: ForkState,
    child: Option<Child>,
    handle: Option<ForkHandle>,
    log_drain: Option<JoinHandle<()>>,
}

/// Owns at most one fork process at a time
pub struct ForkProcessManager {
    config: ForkConfig,
    config_out: Option<PathBuf>,
    client: reqwest::Client,
    inner: Mutex<ForkInner>,
}

impl ForkProcessManager {
    pub fn new(config: ForkConfig) -> Self {
        Self {
            config,
            config_out: None,
            client: reqwest::Client::new(),
            inner: Mutex::new(ForkInner {
                state: ForkState::Stopped,
                child: None,
                handle: None,
                log_drain: None,
            }),
        }
    }

    /// Ask the fork to write its accounts and config to this file
    pub fn with_config_out(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_out = Some(path.into());
        self
    }

    pub fn config(&self) -> &ForkConfig {
        &self.config
    }

    pub async fn state(&self) -> ForkState {
        self.inner.lock().await.state
    }

    pub async fn handle(&self) -> Option<ForkHandle> {
        self.inner.lock().await.handle.clone()
    }

    /// Build the fork command line
    pub fn build_args(&self, request: &ForkRequest, remote_rpc_url: &str) -> Vec<String> {
        let mut args = vec![
            "--chain-id".to_string(),
            request.chain_id.clone(),
            "--host".to_string(),
            self.config.host.clone(),
            "--port".to_string(),
            self.config.port.to_string(),
            "--gas-price".to_string(),
            "0".to_string(),
            "--base-fee".to_string(),
            "0".to_string(),
        ];

        if let Some(path) = &self.config_out {
            args.push("--config-out".to_string());
            args.push(path.to_string_lossy().to_string());
        }

        if let Some(block) = &request.block_number {
            args.push("--fork-block-number".to_string());
            args.push(block.clone());
        }

        args.push("--fork-url".to_string());
        args.push(remote_rpc_url.to_string());

        args
    }

    /// Launch and wait until the fork answers JSON-RPC
    pub async fn start(&self, request: ForkRequest) -> Result<ForkHandle> {
        self.launch(request).await?;
        self.wait_until_ready().await
    }

    /// Spawn the fork process without waiting for readiness
    pub async fn launch(&self, request: ForkRequest) -> Result<ForkHandle> {
        let mut inner = self.inner.lock().await;
        if inner.state != ForkState::Stopped {
            return Err(StoryError::InvalidStateTransition {
                from: inner.state.to_string(),
                to: ForkState::Starting.to_string(),
            });
        }

        let remote_rpc_url = match &request.rpc_url {
            Some(url) => url.clone(),
            None => self.config.resolve_rpc_url(&request.chain_id)?,
        };
        let args = self.build_args(&request, &remote_rpc_url);

        info!(
            "Forking chain {} at block {} with {}",
            request.chain_id,
            request.block_number.as_deref().unwrap_or("latest"),
            self.config.binary
        );
        debug!("Fork args: {}", args[..args.len() - 1].join(" "));

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StoryError::ForkExited {
                status: format!("failed to spawn {}: {}", self.config.binary, e),
            })?;

        let pid = child.id();
        info!("Fork process started (pid: {:?})", pid);

        let drain = spawn_log_drain(child.stdout.take(), child.stderr.take());

        let handle = ForkHandle {
            chain_id: request.chain_id,
            block_number: request.block_number,
            remote_rpc_url,
            local_rpc_url: self.config.local_rpc_url(),
            pid,
            ready_deadline: Instant::now() + self.config.ready_timeout(),
        };

        inner.state = ForkState::Starting;
        inner.child = Some(child);
        inner.handle = Some(handle.clone());
        inner.log_drain = Some(drain);

        Ok(handle)
    }

    /// Poll the local RPC URL until it answers 200 or the deadline passes
    pub async fn wait_until_ready(&self) -> Result<ForkHandle> {
        let handle = {
            let inner = self.inner.lock().await;
            match (inner.state, &inner.handle) {
                (ForkState::Ready, Some(handle)) => return Ok(handle.clone()),
                (ForkState::Starting, Some(handle)) => handle.clone(),
                (state, _) => {
                    return Err(StoryError::InvalidStateTransition {
                        from: state.to_string(),
                        to: ForkState::Ready.to_string(),
                    })
                }
            }
        };

        let chain_id_request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_chainId",
            "params": [],
        });
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            {
                let mut inner = self.inner.lock().await;
                if inner.state != ForkState::Starting {
                    return Err(StoryError::InvalidStateTransition {
                        from: inner.state.to_string(),
                        to: ForkState::Ready.to_string(),
                    });
                }
                let exited = match inner.child.as_mut() {
                    Some(child) => child.try_wait()?,
                    None => None,
                };
                if let Some(status) = exited {
                    inner.state = ForkState::Failed;
                    return Err(StoryError::ForkExited {
                        status: status.to_string(),
                    });
                }
            }

            // A listener that accepts but never answers must not outlast the deadline
            let budget = handle
                .ready_deadline
                .saturating_duration_since(Instant::now())
                .max(MIN_CHECK_BUDGET);
            let answer = timeout(
                budget,
                self.client
                    .post(&handle.local_rpc_url)
                    .json(&chain_id_request)
                    .send(),
            )
            .await;

            match answer {
                Ok(Ok(resp)) if resp.status() == reqwest::StatusCode::OK => {
                    self.inner.lock().await.state = ForkState::Ready;
                    info!(
                        "Fork ready at {} after {} check(s)",
                        handle.local_rpc_url, attempts
                    );
                    return Ok(handle);
                }
                Ok(Ok(resp)) => {
                    debug!("Fork readiness check returned {}", resp.status());
                }
                Ok(Err(e)) => {
                    if attempts == 1 {
                        info!("Waiting for fork at {}...", handle.local_rpc_url);
                    }
                    // Refused connections are expected while the fork boots
                    if !e.is_connect() {
                        debug!("Fork readiness check error: {}", e);
                    }
                }
                Err(_) => {
                    debug!("Fork readiness check got no answer within {:?}", budget);
                }
            }

            if Instant::now() >= handle.ready_deadline {
                self.inner.lock().await.state = ForkState::Failed;
                return Err(StoryError::StartupTimeout {
                    seconds: self.config.ready_timeout_secs,
                });
            }

            sleep(self.config.poll_interval()).await;
        }
    }

    /// Terminate the fork. Safe to call in any state and more than once.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let Some(mut child) = inner.child.take() else {
            if let Some(drain) = inner.log_drain.take() {
                drain.abort();
            }
            return Ok(());
        };

        let failed = inner.state == ForkState::Failed;
        inner.state = ForkState::Stopping;
        info!("Stopping fork (pid: {:?})", child.id());

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to fork failed: {}", e);
            }
        }

        match timeout(self.config.stop_grace(), child.wait()).await {
            Ok(Ok(status)) => debug!("Fork exited: {}", status),
            Ok(Err(e)) => warn!("Failed waiting for fork: {}", e),
            Err(_) => {
                warn!(
                    "Fork still running after {}s, killing",
                    self.config.stop_grace_secs
                );
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill fork: {}", e);
                }
                if timeout(self.config.kill_wait(), child.wait()).await.is_err() {
                    warn!("Fork did not exit after kill");
                }
            }
        }

        if let Some(drain) = inner.log_drain.take() {
            drain.abort();
        }
        inner.handle = None;
        inner.state = if failed {
            ForkState::Failed
        } else {
            ForkState::Stopped
        };

        Ok(())
    }
}

impl Drop for ForkProcessManager {
    fn drop(&mut self) {
        // The child itself is killed on drop.
        if let Some(drain) = self.inner.get_mut().log_drain.take() {
            drain.abort();
        }
    }
}

#[async_trait]
impl ChainFork for ForkProcessManager {
    async fn start_fork(&self, request: ForkRequest) -> Result<ChainEndpoints> {
        Ok(self.start(request).await?.endpoints())
    }

    async fn endpoints(&self) -> Option<ChainEndpoints> {
        self.handle().await.map(|handle| handle.endpoints())
    }
}

/// Forward fork stdout at debug and stderr at warn under the `anvil` target
fn spawn_log_drain<O, E>(stdout: Option<O>, stderr: Option<E>) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let out = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "anvil", "{}", line);
                }
            }
        };
        let err = async {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "anvil", "{}", line);
                }
            }
        };
        tokio::join!(out, err);
    })
}
