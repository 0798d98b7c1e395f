//! StoryCheck interpreter
//!
//! Turns a markdown user story into actions: the prerequisites bring up a
//! chain fork, the user steps drive a mobile browser through the app with a
//! UI grounding model locating what to click, and the expected results check
//! the recorded transactions and run verifier scripts.

pub mod browser;
pub mod classify;
pub mod geometry;
pub mod grounding;
pub mod runner;
pub mod scope;
pub mod sections;
pub mod snapshot;
pub mod story;
pub mod verifier;

pub use browser::{BrowserPage, BrowserSession};
pub use classify::{ActionClass, Classifier, Matcher};
pub use grounding::{Grounding, LazyGrounding, RemoteGrounding, UiGrounding};
pub use runner::{RunReport, StoryPaths, StoryRunner};
pub use scope::{scoped, Scoped, Teardown};
pub use sections::{StepInterpreter, StorySection};
pub use story::StoryParser;
pub use verifier::{VerifierOutcome, VerifierRunner};
