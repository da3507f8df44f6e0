use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::surface::traits::{Surface, SurfaceEvent};

/// Outcome of waiting for a freshly bound source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Nothing decisive happened in time; treated as a soft success.
    TimedOut,
    Failed(String),
}

impl Readiness {
    pub fn is_loaded(&self) -> bool {
        !matches!(self, Readiness::Failed(_))
    }
}

/// A listener registered on a surface before binding, so no outcome can be missed.
///
/// Consumed by [`ReadinessWait::wait`]; the listener goes away with it, which
/// is what makes the outcome single-shot.
pub struct ReadinessWait {
    events: broadcast::Receiver<SurfaceEvent>,
}

impl ReadinessWait {
    pub fn arm(surface: &dyn Surface) -> Self {
        Self {
            events: surface.subscribe(),
        }
    }

    pub async fn wait(self, timeout: Duration) -> Readiness {
        let mut events = self.events;
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(SurfaceEvent::Ready) => return Readiness::Ready,
                    Ok(SurfaceEvent::Error(reason)) => return Readiness::Failed(reason),
                    Ok(SurfaceEvent::Warning(reason)) => {
                        debug!("surface warning while waiting: {}", reason);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("readiness listener lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        return Readiness::Failed("surface closed".to_string());
                    }
                }
            }
        })
        .await;

        outcome.unwrap_or(Readiness::TimedOut)
    }
}

/// Bind `source` and wait for the first decisive surface outcome.
pub async fn bind_and_wait(surface: &dyn Surface, source: &str, timeout: Duration) -> Readiness {
    let wait = ReadinessWait::arm(surface);
    surface.bind(source);
    wait.wait(timeout).await
}
