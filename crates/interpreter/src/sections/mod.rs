//! Story sections
//!
//! A [`StorySection`] classifies each prompt and hands it to the handler
//! registered for that class. Step errors are recorded and the section moves
//! on; fatal errors stop the section and propagate.

pub mod expected_results;
pub mod prerequisites;
pub mod user_steps;

use async_trait::async_trait;
use std::collections::HashMap;
use storycheck_common::{Prompt, Result, SectionKind, StoryFailure};
use tracing::{info, warn};

use crate::classify::{ActionClass, Classifier};

pub use expected_results::{expected_results, CheckContext};
pub use prerequisites::{prerequisites, ForkContext};
pub use user_steps::{user_steps, StepContext};

/// Carries out one classified prompt against a section context
#[async_trait]
pub trait StepInterpreter<C: ?Sized + Sync>: Send + Sync {
    async fn interpret(&self, prompt: &Prompt, ctx: &C) -> Result<()>;
}

/// Handler for prompts nothing else claims
pub struct NotImplemented;

#[async_trait]
impl<C: ?Sized + Sync> StepInterpreter<C> for NotImplemented {
    async fn interpret(&self, prompt: &Prompt, _ctx: &C) -> Result<()> {
        warn!("No handler for '{}'; skipping", prompt.text);
        Ok(())
    }
}

pub struct StorySection<C: ?Sized + Sync> {
    kind: SectionKind,
    classifier: Classifier,
    handlers: HashMap<ActionClass, Box<dyn StepInterpreter<C>>>,
    fallback: Box<dyn StepInterpreter<C>>,
}

impl<C: ?Sized + Sync + 'static> StorySection<C> {
    pub fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            classifier: Classifier::for_section(kind),
            handlers: HashMap::new(),
            fallback: Box::new(NotImplemented),
        }
    }

    pub fn handler(mut self, class: ActionClass, handler: impl StepInterpreter<C> + 'static) -> Self {
        self.handlers.insert(class, Box::new(handler));
        self
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    /// Handler for a classification result
    pub fn dispatch(&self, class: Option<ActionClass>) -> &dyn StepInterpreter<C> {
        class
            .and_then(|class| self.handlers.get(&class))
            .map(|handler| handler.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }

    /// Run every prompt in order. Returns the recorded step failures.
    pub async fn run(&self, prompts: &[Prompt], ctx: &C) -> Result<Vec<StoryFailure>> {
        let mut failures = Vec::new();
        if prompts.is_empty() {
            return Ok(failures);
        }
        info!("{}: {} step(s)", self.kind, prompts.len());

        for (index, prompt) in prompts.iter().enumerate() {
            let class = self.classifier.classify(prompt);
            info!(
                "[{} {}/{}] {} ({})",
                self.kind,
                index + 1,
                prompts.len(),
                prompt.text,
                class.map(|c| c.to_string()).unwrap_or_else(|| "unclassified".into())
            );

            if let Err(e) = self.dispatch(class).interpret(prompt, ctx).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Step '{}' failed: {}", prompt.text, e);
                failures.push(StoryFailure::at_step(self.kind, index, prompt, &e));
            }
        }

        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use storycheck_common::StoryError;

    #[derive(Default)]
    struct Journal {
        seen: Mutex<Vec<String>>,
    }

    struct Record(&'static str);

    #[async_trait]
    impl StepInterpreter<Journal> for Record {
        async fn interpret(&self, prompt: &Prompt, ctx: &Journal) -> Result<()> {
            ctx.seen.lock().push(format!("{}:{}", self.0, prompt.text));
            Ok(())
        }
    }

    struct Fail(fn() -> StoryError);

    #[async_trait]
    impl StepInterpreter<Journal> for Fail {
        async fn interpret(&self, _prompt: &Prompt, _ctx: &Journal) -> Result<()> {
            Err((self.0)())
        }
    }

    fn prompts(texts: &[&str]) -> Vec<Prompt> {
        texts.iter().map(|t| Prompt::new(*t)).collect()
    }

    #[tokio::test]
    async fn test_dispatches_by_class_in_order() {
        let section = StorySection::<Journal>::new(SectionKind::UserSteps)
            .handler(ActionClass::Scroll, Record("scroll"))
            .handler(ActionClass::Click, Record("click"));
        let journal = Journal::default();

        let failures = section
            .run(&prompts(&["Click Connect", "Scroll down", "Swap button"]), &journal)
            .await
            .unwrap();

        assert!(failures.is_empty());
        assert_eq!(
            *journal.seen.lock(),
            vec!["click:Click Connect", "scroll:Scroll down", "click:Swap button"]
        );
    }

    #[tokio::test]
    async fn test_unhandled_prompt_is_skipped() {
        let section = StorySection::<Journal>::new(SectionKind::Prerequisites)
            .handler(ActionClass::Chain, Record("chain"));
        let journal = Journal::default();

        let failures = section
            .run(&prompts(&["Wallet with 10 ETH", "Chain: id:1"]), &journal)
            .await
            .unwrap();

        assert!(failures.is_empty());
        assert_eq!(*journal.seen.lock(), vec!["chain:Chain: id:1"]);
    }

    #[tokio::test]
    async fn test_step_error_recorded_and_run_continues() {
        let section = StorySection::<Journal>::new(SectionKind::UserSteps)
            .handler(ActionClass::Click, Fail(|| StoryError::Grounding("no match".into())))
            .handler(ActionClass::Scroll, Record("scroll"));
        let journal = Journal::default();

        let failures = section
            .run(&prompts(&["Click nothing", "Scroll down"]), &journal)
            .await
            .unwrap();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].section, Some(SectionKind::UserSteps));
        assert_eq!(failures[0].step, Some(0));
        assert_eq!(failures[0].prompt.as_deref(), Some("Click nothing"));
        assert_eq!(*journal.seen.lock(), vec!["scroll:Scroll down"]);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_section() {
        let section = StorySection::<Journal>::new(SectionKind::Prerequisites)
            .handler(ActionClass::Chain, Fail(|| StoryError::UnknownChain("999".into())));
        let journal = Journal::default();

        let err = section
            .run(&prompts(&["Chain: id:999", "Chain: id:1"]), &journal)
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::UnknownChain(_)));
    }
}
