//! Scoped resources
//!
//! A story holds two long-lived resources: the chain fork and the browser
//! session. [`scoped`] runs a body while one of them is held and releases it
//! afterwards on every exit path, including cancellation.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use storycheck_chain::ForkProcessManager;
use storycheck_common::{Result, StoryError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a resource is being released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The body finished, successfully or not
    Normal,
    /// The run was cancelled; release quickly and skip optional work
    Cancelled,
}

/// A resource with an explicit asynchronous release
#[async_trait]
pub trait Scoped: Send + Sync {
    fn label(&self) -> &'static str;

    /// Must be safe to call more than once
    async fn release(&self, teardown: Teardown) -> Result<()>;
}

/// How long a cancelled body may keep running so nested scopes can release
pub const UNWIND_GRACE: Duration = Duration::from_secs(5);

/// Run `body` while `resource` is held, then release it.
///
/// On cancellation the body is driven for up to [`UNWIND_GRACE`] more, so
/// scopes nested inside it see the same token and release first, then it is
/// dropped and the result is [`StoryError::Cancelled`]. An error from the
/// body wins over an error from the release.
pub async fn scoped<R, T, F>(resource: &R, cancel: &CancellationToken, body: F) -> Result<T>
where
    R: Scoped + ?Sized,
    F: Future<Output = Result<T>>,
{
    tokio::pin!(body);
    let finished = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = &mut body => Some(result),
    };

    let outcome = match finished {
        Some(result) => result,
        None => {
            if timeout(UNWIND_GRACE, &mut body).await.is_err() {
                warn!(
                    "Work inside {} still running {:?} after cancellation; dropping it",
                    resource.label(),
                    UNWIND_GRACE
                );
            }
            Err(StoryError::Cancelled)
        }
    };

    let teardown = if cancel.is_cancelled() {
        Teardown::Cancelled
    } else {
        Teardown::Normal
    };
    debug!("Releasing {} ({:?})", resource.label(), teardown);
    let released = resource.release(teardown).await;

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!("Releasing {} also failed: {}", resource.label(), release_err);
            Err(e)
        }
    }
}

#[async_trait]
impl Scoped for ForkProcessManager {
    fn label(&self) -> &'static str {
        "chain fork"
    }

    async fn release(&self, _teardown: Teardown) -> Result<()> {
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Tracked {
        label: &'static str,
        fail_release: bool,
        log: Arc<Mutex<Vec<(&'static str, Teardown)>>>,
    }

    #[async_trait]
    impl Scoped for Tracked {
        fn label(&self) -> &'static str {
            self.label
        }

        async fn release(&self, teardown: Teardown) -> Result<()> {
            self.log.lock().push((self.label, teardown));
            if self.fail_release {
                return Err(StoryError::Browser("close failed".into()));
            }
            Ok(())
        }
    }

    fn tracked(label: &'static str, log: &Arc<Mutex<Vec<(&'static str, Teardown)>>>) -> Tracked {
        Tracked {
            label,
            log: log.clone(),
            ..Tracked::default()
        }
    }

    #[tokio::test]
    async fn test_releases_after_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resource = tracked("fork", &log);
        let cancel = CancellationToken::new();

        let value = scoped(&resource, &cancel, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(*log.lock(), vec![("fork", Teardown::Normal)]);
    }

    #[tokio::test]
    async fn test_body_error_kept_over_release_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resource = Tracked {
            fail_release: true,
            ..tracked("browser", &log)
        };
        let cancel = CancellationToken::new();

        let err = scoped(&resource, &cancel, async {
            Err::<(), _>(StoryError::Parse("bad story".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoryError::Parse(_)));
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_release_error_surfaces_after_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resource = Tracked {
            fail_release: true,
            ..tracked("browser", &log)
        };
        let cancel = CancellationToken::new();

        let err = scoped(&resource, &cancel, async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, StoryError::Browser(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_resource() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resource = tracked("fork", &log);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = scoped(&resource, &cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoryError::Cancelled));
        assert_eq!(*log.lock(), vec![("fork", Teardown::Cancelled)]);
    }

    #[tokio::test]
    async fn test_nested_scopes_release_inner_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fork = tracked("fork", &log);
        let browser = tracked("browser", &log);
        let cancel = CancellationToken::new();

        scoped(&fork, &cancel, async {
            scoped(&browser, &cancel, async { Ok(()) }).await
        })
        .await
        .unwrap();

        let order: Vec<_> = log.lock().iter().map(|(label, _)| *label).collect();
        assert_eq!(order, vec!["browser", "fork"]);
    }

    fn cancel_after(cancel: &CancellationToken, delay: Duration) {
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_nested_scopes_inner_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fork = tracked("fork", &log);
        let browser = tracked("browser", &log);
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(20));

        let err = scoped(&fork, &cancel, async {
            scoped(&browser, &cancel, async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoryError::Cancelled));
        assert_eq!(
            *log.lock(),
            vec![("browser", Teardown::Cancelled), ("fork", Teardown::Cancelled)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_body_dropped_after_grace() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fork = tracked("fork", &log);
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(20));

        let started = tokio::time::Instant::now();
        let err = scoped(&fork, &cancel, async {
            tokio::time::sleep(Duration::from_secs(300)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoryError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(300));
        assert!(started.elapsed() >= UNWIND_GRACE);
        assert_eq!(*log.lock(), vec![("fork", Teardown::Cancelled)]);
    }
}
