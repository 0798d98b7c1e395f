//! Browser session driving the app under test
//!
//! [`BrowserPage`] is the narrow surface step handlers use; [`CdpPage`]
//! implements it over the DevTools protocol. [`BrowserSession`] owns the
//! browser process together with everything attached to it: the injected
//! wallet, RPC rerouting, console logging and recording.

pub mod intercept;
pub mod keys;
pub mod page;
pub mod recording;
pub mod session;
pub mod wallet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storycheck_common::{Result, StoryError};
use tokio::task::JoinSet;

use crate::geometry::{Size, ViewportPoint};

pub use intercept::{Disposition, ForwardedCall, RerouteReply, RpcInterceptor};
pub use keys::{key_definition, KeyDefinition};
pub use page::CdpPage;
pub use session::BrowserSession;
pub use wallet::{WalletBootstrap, WalletIdentity};

/// Page operations available to step handlers
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Viewport in CSS pixels
    fn viewport(&self) -> Size;

    async fn goto(&self, url: &str) -> Result<()>;

    /// PNG bytes of the viewport, or of the whole page
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>>;

    async fn wait_for_load_state(&self, timeout: Duration) -> Result<()>;

    async fn click(&self, point: ViewportPoint) -> Result<()>;

    /// Insert `text` one character at a time
    async fn type_text(&self, text: &str, delay: Duration) -> Result<()>;

    /// Press and release a named key
    async fn press_key(&self, key: &str) -> Result<()>;

    async fn evaluate(&self, script: &str) -> Result<Value>;
}

/// Background tasks tied to one browser session, aborted together on stop
#[derive(Clone, Default)]
pub struct SessionTasks {
    inner: Arc<Mutex<JoinSet<()>>>,
}

impl SessionTasks {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.inner.lock();
        // reap finished tasks so per-request handlers don't pile up
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every task; returns how many were still tracked
    pub fn abort_all(&self) -> usize {
        let mut set = self.inner.lock();
        let count = set.len();
        set.abort_all();
        count
    }
}

pub(crate) fn browser_error(err: impl std::fmt::Display) -> StoryError {
    StoryError::Browser(err.to_string())
}
