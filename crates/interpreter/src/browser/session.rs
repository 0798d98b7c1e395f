//! Browser session lifecycle

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as LaunchConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetTouchEmulationEnabledParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{self, EventRequestWillBeSent};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, SetBypassCspParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    AddBindingParams, ConsoleApiCalledType, EventBindingCalled, EventConsoleApiCalled,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use storycheck_common::{
    BrowserConfig, ChainEndpoints, Result, ResultsDir, Snapshot, StoryError, TransactionRecord,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::intercept::{ForwardedCall, RpcInterceptor};
use super::page::CdpPage;
use super::recording::Recorder;
use super::wallet::{WalletBootstrap, WalletIdentity, LOG_TX_BINDING, REROUTE_BINDING};
use super::{browser_error, BrowserPage, SessionTasks};
use crate::geometry::Size;
use crate::scope::{Scoped, Teardown};

type TxBuffer = Arc<Mutex<Vec<TransactionRecord>>>;

struct ActiveBrowser {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    tasks: SessionTasks,
    recorder: Recorder,
}

/// One browser for one story run
pub struct BrowserSession {
    config: BrowserConfig,
    endpoints: Option<ChainEndpoints>,
    local_rpc_url: String,
    results: ResultsDir,
    transactions: TxBuffer,
    active: tokio::sync::Mutex<Option<ActiveBrowser>>,
}

impl BrowserSession {
    /// `endpoints` is the running fork, if the story started one
    pub fn new(
        config: BrowserConfig,
        endpoints: Option<ChainEndpoints>,
        local_rpc_url: String,
        results: ResultsDir,
    ) -> Self {
        Self {
            config,
            endpoints,
            local_rpc_url,
            results,
            transactions: Arc::new(Mutex::new(Vec::new())),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn endpoints(&self) -> Option<&ChainEndpoints> {
        self.endpoints.as_ref()
    }

    pub fn viewport(&self) -> Size {
        Size::new(self.config.device.width, self.config.device.height)
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    fn launch_config(&self) -> Result<LaunchConfig> {
        let device = &self.config.device;
        let mut builder = LaunchConfig::builder()
            .window_size(device.width, device.height)
            .viewport(Viewport {
                width: device.width,
                height: device.height,
                device_scale_factor: Some(device.device_scale_factor),
                emulating_mobile: device.is_mobile,
                is_landscape: false,
                has_touch: device.has_touch,
            })
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if !self.config.headless {
            builder = builder.with_head();
        }
        if self.config.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(executable) = &self.config.executable {
            builder = builder.chrome_executable(executable);
        }
        builder.build().map_err(StoryError::Browser)
    }

    /// Launch the browser and prepare its page
    pub async fn start(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(StoryError::InvalidStateTransition {
                from: "running".into(),
                to: "running".into(),
            });
        }

        info!(
            "Launching {} browser ({}x{})",
            if self.config.headless { "headless" } else { "headed" },
            self.config.device.width,
            self.config.device.height
        );
        let (mut browser, mut handler) = Browser::launch(self.launch_config()?)
            .await
            .map_err(browser_error)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("DevTools handler loop ended: {}", e);
                    break;
                }
            }
        });

        let tasks = SessionTasks::default();
        match self.prepare_page(&browser, &tasks).await {
            Ok((page, recorder)) => {
                *active = Some(ActiveBrowser {
                    browser,
                    page,
                    handler,
                    tasks,
                    recorder,
                });
                info!("Browser session ready");
                Ok(())
            }
            Err(e) => {
                tasks.abort_all();
                if let Err(close_err) = browser.close().await {
                    debug!("Closing half-started browser: {}", close_err);
                }
                handler.abort();
                Err(e)
            }
        }
    }

    async fn prepare_page(&self, browser: &Browser, tasks: &SessionTasks) -> Result<(Page, Recorder)> {
        let page = browser.new_page("about:blank").await.map_err(browser_error)?;
        let device = &self.config.device;

        page.execute(SetUserAgentOverrideParams::new(device.user_agent.clone()))
            .await
            .map_err(browser_error)?;
        page.execute(SetTouchEmulationEnabledParams::new(device.has_touch))
            .await
            .map_err(browser_error)?;
        page.execute(SetBypassCspParams::new(true))
            .await
            .map_err(browser_error)?;

        self.install_logging(&page, tasks).await?;
        self.install_wallet(&page, tasks).await?;
        let recorder = Recorder::start(&page, &self.results, self.config.record_video, tasks).await?;

        Ok((page, recorder))
    }

    async fn install_logging(&self, page: &Page, tasks: &SessionTasks) -> Result<()> {
        let mut console = page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(browser_error)?;
        tasks.spawn(async move {
            while let Some(event) = console.next().await {
                log_console(&event);
            }
        });

        page.execute(network::EnableParams::default())
            .await
            .map_err(browser_error)?;
        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(browser_error)?;
        tasks.spawn(async move {
            while let Some(event) = requests.next().await {
                if event.request.method == "POST" {
                    let call = ForwardedCall::from_request(&event.request);
                    debug!(target: "browser", "POST {} {}", call.url, call.body_text());
                }
            }
        });
        Ok(())
    }

    async fn install_wallet(&self, page: &Page, tasks: &SessionTasks) -> Result<()> {
        let identity = WalletIdentity::generate();
        info!("Mock wallet account {}", identity.account);

        let mut bootstrap = WalletBootstrap::new(
            identity,
            self.local_rpc_url.clone(),
            self.endpoints.as_ref(),
            self.config.wallet_balance.clone(),
        );
        if let Some(path) = &self.config.wallet_script {
            bootstrap = bootstrap.with_bundle(WalletBootstrap::load_bundle(path)?);
        }

        let mut bindings = page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(browser_error)?;
        page.execute(AddBindingParams::new(LOG_TX_BINDING))
            .await
            .map_err(browser_error)?;
        page.execute(AddBindingParams::new(REROUTE_BINDING))
            .await
            .map_err(browser_error)?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(bootstrap.script()?))
            .await
            .map_err(browser_error)?;

        let buffer = self.transactions.clone();
        let interceptor = self.endpoints.clone().map(|e| Arc::new(RpcInterceptor::new(e)));
        let page = page.clone();
        let spawner = tasks.clone();
        tasks.spawn(async move {
            let mut rerouting = false;
            while let Some(call) = bindings.next().await {
                match call.name.as_str() {
                    LOG_TX_BINDING => record_transaction(&buffer, &call.payload),
                    REROUTE_BINDING if !rerouting => match &interceptor {
                        Some(interceptor) => match interceptor.clone().activate(&page, &spawner).await {
                            Ok(()) => rerouting = true,
                            Err(e) => error!("Enabling RPC reroute failed: {}", e),
                        },
                        None => {
                            debug!("No chain fork running; RPC traffic is not rerouted");
                            rerouting = true;
                        }
                    },
                    _ => {}
                }
            }
        });
        Ok(())
    }

    /// Page handle for step handlers
    pub async fn page(&self) -> Result<Arc<dyn BrowserPage>> {
        let active = self.active.lock().await;
        let active = active
            .as_ref()
            .ok_or_else(|| StoryError::Browser("browser session is not running".into()))?;
        Ok(Arc::new(CdpPage::new(active.page.clone(), self.viewport())))
    }

    /// Transactions the wallet has reported so far
    pub fn transactions(&self) -> Snapshot {
        Snapshot(self.transactions.lock().clone())
    }

    /// Write the transaction log to the results directory
    pub fn persist_transactions(&self) -> Result<PathBuf> {
        let path = self.results.tx_snapshot_path();
        self.transactions().save(&path)?;
        debug!("Persisted {} transaction(s) to {}", self.transactions.lock().len(), path.display());
        Ok(path)
    }

    /// Close the browser. A cancelled teardown skips the trace and the
    /// graceful close. Safe to call more than once.
    pub async fn stop(&self, teardown: Teardown) -> Result<()> {
        let Some(active) = self.active.lock().await.take() else {
            return Ok(());
        };
        let ActiveBrowser {
            mut browser,
            page,
            handler,
            tasks,
            recorder,
        } = active;

        if let Err(e) = self.persist_transactions() {
            warn!("Persisting transactions failed: {}", e);
        }
        let aborted = tasks.abort_all();
        debug!("Aborted {} session task(s)", aborted);

        if teardown == Teardown::Cancelled {
            warn!("Run cancelled; killing browser without saving the trace");
            if let Some(Err(e)) = browser.kill().await {
                debug!("Killing browser: {}", e);
            }
            handler.abort();
            return Ok(());
        }

        if let Err(e) = recorder.stop(&page, &self.results.trace_path()).await {
            warn!("Saving trace failed: {}", e);
        }
        if let Err(e) = browser.close().await {
            warn!("Closing browser failed: {}", e);
        }
        if let Err(e) = browser.wait().await {
            debug!("Waiting for browser exit: {}", e);
        }
        handler.abort();
        info!("Browser session closed");
        Ok(())
    }
}

#[async_trait]
impl Scoped for BrowserSession {
    fn label(&self) -> &'static str {
        "browser session"
    }

    async fn release(&self, teardown: Teardown) -> Result<()> {
        self.stop(teardown).await
    }
}

fn record_transaction(buffer: &TxBuffer, payload: &str) {
    match TransactionRecord::from_payload(payload) {
        Ok(record) => {
            let mut txs = buffer.lock();
            txs.push(record);
            info!(target: "wallet", "Transaction #{} recorded", txs.len());
        }
        Err(e) => warn!(target: "wallet", "Ignoring malformed transaction record: {}", e),
    }
}

fn log_console(event: &EventConsoleApiCalled) {
    let text = event
        .args
        .iter()
        .map(|arg| match &arg.value {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => arg.description.clone().unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join(" ");

    match event.r#type {
        ConsoleApiCalledType::Error | ConsoleApiCalledType::Assert => error!(target: "browser", "{}", text),
        ConsoleApiCalledType::Warning => warn!(target: "browser", "{}", text),
        ConsoleApiCalledType::Log | ConsoleApiCalledType::Info => info!(target: "browser", "{}", text),
        _ => debug!(target: "browser", "{}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(dir: &std::path::Path) -> BrowserSession {
        BrowserSession::new(
            BrowserConfig::default(),
            None,
            "http://127.0.0.1:8545".into(),
            ResultsDir::create(dir).unwrap(),
        )
    }

    #[test]
    fn test_record_transaction_appends_in_order() {
        let buffer: TxBuffer = Arc::default();
        record_transaction(&buffer, r#"{"writeTx":{"method":"eth_sendTransaction","params":[{"to":"0x1"}]},"writeTxResult":"0xa"}"#);
        record_transaction(&buffer, "not json");
        record_transaction(&buffer, r#"{"writeTx":{"method":"eth_sendTransaction","params":[{"to":"0x2"}]}}"#);

        let txs = buffer.lock();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].write_tx.params[0]["to"], "0x2");
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        assert!(!session.is_active().await);
        session.stop(Teardown::Normal).await.unwrap();
        session.release(Teardown::Cancelled).await.unwrap();
    }

    #[tokio::test]
    async fn test_page_requires_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let err = session(dir.path()).page().await.err().unwrap();
        assert!(matches!(err, StoryError::Browser(_)));
    }

    #[test]
    fn test_persist_empty_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let path = session.persist_transactions().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap().trim(), "[]");
    }

    #[test]
    fn test_launch_config_builds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BrowserConfig::default();
        config.executable = Some(PathBuf::from("/usr/bin/chromium"));
        config.no_sandbox = true;
        let session = BrowserSession::new(config, None, String::new(), ResultsDir::create(dir.path()).unwrap());
        assert!(session.launch_config().is_ok());
    }
}
