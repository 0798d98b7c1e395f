//! [`BrowserPage`] over a DevTools page

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, InsertTextParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::layout::Point;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde_json::Value;
use std::time::Duration;
use storycheck_common::{Result, StoryError};
use tokio::time::Instant;
use tracing::debug;

use super::keys::{key_definition, KeyDefinition};
use super::{browser_error, BrowserPage};
use crate::geometry::{Size, ViewportPoint};

const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct CdpPage {
    page: Page,
    viewport: Size,
}

impl CdpPage {
    pub fn new(page: Page, viewport: Size) -> Self {
        Self { page, viewport }
    }

    async fn dispatch_key(&self, kind: DispatchKeyEventType, def: &KeyDefinition, with_text: bool) -> Result<()> {
        let mut builder = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key(def.key.clone())
            .code(def.code.clone())
            .windows_virtual_key_code(def.key_code)
            .native_virtual_key_code(def.key_code);
        if let Some(text) = def.text.as_ref().filter(|_| with_text) {
            builder = builder.text(text.clone());
        }
        let params = builder.build().map_err(StoryError::Browser)?;
        self.page.execute(params).await.map_err(browser_error)?;
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for CdpPage {
    fn viewport(&self) -> Size {
        self.viewport
    }

    async fn goto(&self, url: &str) -> Result<()> {
        debug!("Navigating to {}", url);
        self.page.goto(url).await.map_err(browser_error)?;
        Ok(())
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();
        self.page.screenshot(params).await.map_err(browser_error)
    }

    async fn wait_for_load_state(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.evaluate("document.readyState").await?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoryError::Timeout {
                    what: "page load".into(),
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(LOAD_POLL_INTERVAL).await;
        }
    }

    async fn click(&self, point: ViewportPoint) -> Result<()> {
        debug!("Clicking at ({}, {})", point.x, point.y);
        self.page
            .click(Point::new(point.x as f64, point.y as f64))
            .await
            .map_err(browser_error)?;
        Ok(())
    }

    async fn type_text(&self, text: &str, delay: Duration) -> Result<()> {
        for ch in text.chars() {
            self.page
                .execute(InsertTextParams::new(ch.to_string()))
                .await
                .map_err(browser_error)?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let def = key_definition(key);
        debug!("Pressing {}", def.key);
        self.dispatch_key(DispatchKeyEventType::KeyDown, &def, true).await?;
        self.dispatch_key(DispatchKeyEventType::KeyUp, &def, false).await
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let result = self.page.evaluate(script).await.map_err(browser_error)?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }
}
