//! User steps: drive the app through the browser
//!
//! Every step is audited: a full-page screenshot of the state the step acts
//! on is saved before the handler runs.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storycheck_common::{BrowserConfig, Prompt, Result, ResultsDir, SectionKind, StoryError};
use tracing::{debug, info, warn};

use super::{StepInterpreter, StorySection};
use crate::browser::BrowserPage;
use crate::classify::ActionClass;
use crate::geometry::{self, Size};
use crate::grounding::{annotate_click, UiGrounding};

static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("valid regex"));
static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]*)"|'([^']*)'|“([^”]*)”"#).expect("valid regex"));

/// Everything a user step needs
pub struct StepContext {
    pub page: Arc<dyn BrowserPage>,
    pub grounding: Arc<dyn UiGrounding>,
    pub results: ResultsDir,
    pub settle_delay: Duration,
    pub load_timeout: Duration,
    pub type_delay: Duration,
}

impl StepContext {
    pub fn new(
        page: Arc<dyn BrowserPage>,
        grounding: Arc<dyn UiGrounding>,
        results: ResultsDir,
        config: &BrowserConfig,
    ) -> Self {
        Self {
            page,
            grounding,
            results,
            settle_delay: config.settle_delay(),
            load_timeout: config.load_timeout(),
            type_delay: config.type_delay(),
        }
    }

    /// Take a full-page screenshot, let the page load and settle, then save
    /// the screenshot under a name derived from the step
    pub async fn capture_step(&self, prompt: &Prompt) -> Result<PathBuf> {
        let png = self.page.screenshot(true).await?;
        if let Err(e) = self.page.wait_for_load_state(self.load_timeout).await {
            warn!("Page not loaded before '{}': {}", prompt.text, e);
        }
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        let path = self.results.step_screenshot_path(&prompt.text, None);
        tokio::fs::write(&path, png).await?;
        debug!("Step screenshot {}", path.display());
        Ok(path)
    }

    /// Screenshot of the state after the last step
    pub async fn capture_final(&self) -> Result<PathBuf> {
        let png = self.page.screenshot(true).await?;
        let path = self.results.final_screenshot_path();
        tokio::fs::write(&path, png).await?;
        info!("Final screenshot {}", path.display());
        Ok(path)
    }
}

/// Screenshot before delegating to the wrapped handler
pub struct Audited<H>(pub H);

#[async_trait]
impl<H: StepInterpreter<StepContext>> StepInterpreter<StepContext> for Audited<H> {
    async fn interpret(&self, prompt: &Prompt, ctx: &StepContext) -> Result<()> {
        ctx.capture_step(prompt).await?;
        self.0.interpret(prompt, ctx).await
    }
}

/// URL a browse step points at: the prompt's link, else the first URL in
/// its text
pub fn target_url(prompt: &Prompt) -> Option<String> {
    if let Some(link) = &prompt.link {
        return Some(link.clone());
    }
    URL.find(&prompt.text).map(|m| {
        m.as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')' | '"' | '\''))
            .to_string()
    })
}

/// Text a type step enters: the first quoted string, else everything after
/// the verb
pub fn typed_text(prompt: &Prompt) -> Option<String> {
    if let Some(caps) = QUOTED.captures(&prompt.text) {
        return caps
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().to_string());
    }
    let (_, rest) = prompt.text.trim().split_once(char::is_whitespace)?;
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

/// Key named by a press step: "Press the Enter key" -> "Enter"
pub fn key_name(prompt: &Prompt) -> Option<String> {
    let words: Vec<&str> = prompt
        .text
        .split_whitespace()
        .skip(1)
        .map(|w| w.trim_end_matches(|c: char| matches!(c, '.' | '!' | ',')))
        .filter(|w| !w.is_empty() && !w.eq_ignore_ascii_case("the") && !w.eq_ignore_ascii_case("key"))
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
    Top,
    Bottom,
}

impl ScrollDirection {
    /// First direction word in the prompt; down when none
    pub fn from_prompt(prompt: &Prompt) -> Self {
        prompt
            .normalized()
            .split(|c: char| !c.is_alphanumeric())
            .find_map(|word| match word {
                "up" => Some(Self::Up),
                "down" => Some(Self::Down),
                "left" => Some(Self::Left),
                "right" => Some(Self::Right),
                "top" => Some(Self::Top),
                "bottom" | "end" => Some(Self::Bottom),
                _ => None,
            })
            .unwrap_or(Self::Down)
    }

    /// Script scrolling the window one viewport in this direction
    pub fn script(self, viewport: Size) -> String {
        let (w, h) = (viewport.width, viewport.height);
        match self {
            Self::Up => format!("window.scrollBy(0, -{})", h),
            Self::Down => format!("window.scrollBy(0, {})", h),
            Self::Left => format!("window.scrollBy(-{}, 0)", w),
            Self::Right => format!("window.scrollBy({}, 0)", w),
            Self::Top => "window.scrollTo(0, 0)".to_string(),
            Self::Bottom => "window.scrollTo(0, document.body.scrollHeight)".to_string(),
        }
    }
}

pub struct BrowseStep;

#[async_trait]
impl StepInterpreter<StepContext> for BrowseStep {
    async fn interpret(&self, prompt: &Prompt, ctx: &StepContext) -> Result<()> {
        let url = target_url(prompt)
            .ok_or_else(|| StoryError::StepFailed(format!("no URL in '{}'", prompt.text)))?;
        info!("Browsing to {}", url);
        ctx.page.goto(&url).await
    }
}

/// Ask the grounding model where the prompt points and click there
pub struct ClickStep;

#[async_trait]
impl StepInterpreter<StepContext> for ClickStep {
    async fn interpret(&self, prompt: &Prompt, ctx: &StepContext) -> Result<()> {
        let png = ctx.page.screenshot(false).await?;
        let screenshot = image::load_from_memory(&png)?;
        let grounding = ctx.grounding.locate(&screenshot, &prompt.text).await?;

        let target = geometry::normalized_to_viewport(grounding.point, ctx.page.viewport());
        info!(
            "'{}' grounded at ({:.3}, {:.3}) -> ({}, {})",
            prompt.text, grounding.point.x, grounding.point.y, target.x, target.y
        );

        let annotated = grounding
            .annotated
            .unwrap_or_else(|| annotate_click(&screenshot, grounding.point));
        let path = ctx.results.step_screenshot_path(&prompt.text, Some("annotated"));
        if let Err(e) = annotated.save(&path) {
            warn!("Saving {} failed: {}", path.display(), e);
        }

        ctx.page.click(target).await
    }
}

pub struct TypeTextStep;

#[async_trait]
impl StepInterpreter<StepContext> for TypeTextStep {
    async fn interpret(&self, prompt: &Prompt, ctx: &StepContext) -> Result<()> {
        let text = typed_text(prompt)
            .ok_or_else(|| StoryError::StepFailed(format!("nothing to type in '{}'", prompt.text)))?;
        debug!("Typing {} character(s)", text.chars().count());
        ctx.page.type_text(&text, ctx.type_delay).await
    }
}

pub struct KeyPressStep;

#[async_trait]
impl StepInterpreter<StepContext> for KeyPressStep {
    async fn interpret(&self, prompt: &Prompt, ctx: &StepContext) -> Result<()> {
        let key = key_name(prompt)
            .ok_or_else(|| StoryError::StepFailed(format!("no key named in '{}'", prompt.text)))?;
        ctx.page.press_key(&key).await
    }
}

pub struct ScrollStep;

#[async_trait]
impl StepInterpreter<StepContext> for ScrollStep {
    async fn interpret(&self, prompt: &Prompt, ctx: &StepContext) -> Result<()> {
        let direction = ScrollDirection::from_prompt(prompt);
        debug!("Scrolling {:?}", direction);
        ctx.page.evaluate(&direction.script(ctx.page.viewport())).await?;
        Ok(())
    }
}

pub fn user_steps() -> StorySection<StepContext> {
    StorySection::new(SectionKind::UserSteps)
        .handler(ActionClass::Browse, Audited(BrowseStep))
        .handler(ActionClass::Click, Audited(ClickStep))
        .handler(ActionClass::TypeText, Audited(TypeTextStep))
        .handler(ActionClass::KeyPress, Audited(KeyPressStep))
        .handler(ActionClass::Scroll, Audited(ScrollStep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Browse to https://app.uniswap.org", Some("https://app.uniswap.org"))]
    #[test_case("Browse https://app.example/swap?x=1.", Some("https://app.example/swap?x=1"))]
    #[test_case("Browse (see https://a.example/b), then wait", Some("https://a.example/b"))]
    #[test_case("Browse to the app", None)]
    fn test_target_url(text: &str, expected: Option<&str>) {
        assert_eq!(target_url(&Prompt::new(text)).as_deref(), expected);
    }

    #[test]
    fn test_link_wins_over_text() {
        let prompt = Prompt::new("Browse to https://ignored.example").with_link("https://linked.example");
        assert_eq!(target_url(&prompt).as_deref(), Some("https://linked.example"));
    }

    #[test_case("Type \"0.5\"", Some("0.5"))]
    #[test_case("Type 'hello world' in the search box", Some("hello world"))]
    #[test_case("Enter 100", Some("100"))]
    #[test_case("Input vitalik.eth", Some("vitalik.eth"))]
    #[test_case("Type", None)]
    fn test_typed_text(text: &str, expected: Option<&str>) {
        assert_eq!(typed_text(&Prompt::new(text)).as_deref(), expected);
    }

    #[test_case("Press Enter", Some("Enter"))]
    #[test_case("Press the Tab key", Some("Tab"))]
    #[test_case("press the page down key.", Some("page down"))]
    #[test_case("Press", None)]
    fn test_key_name(text: &str, expected: Option<&str>) {
        assert_eq!(key_name(&Prompt::new(text)).as_deref(), expected);
    }

    #[test_case("Scroll down", ScrollDirection::Down)]
    #[test_case("Scroll up a bit", ScrollDirection::Up)]
    #[test_case("Scroll to the bottom", ScrollDirection::Bottom)]
    #[test_case("Scroll to top", ScrollDirection::Top)]
    #[test_case("Scroll right", ScrollDirection::Right)]
    #[test_case("Scroll", ScrollDirection::Down ; "defaults to down")]
    fn test_scroll_direction(text: &str, expected: ScrollDirection) {
        assert_eq!(ScrollDirection::from_prompt(&Prompt::new(text)), expected);
    }

    #[test]
    fn test_scroll_script_uses_viewport() {
        let viewport = Size::new(393, 727);
        assert_eq!(ScrollDirection::Down.script(viewport), "window.scrollBy(0, 727)");
        assert_eq!(ScrollDirection::Left.script(viewport), "window.scrollBy(-393, 0)");
        assert_eq!(ScrollDirection::Top.script(viewport), "window.scrollTo(0, 0)");
    }
}
