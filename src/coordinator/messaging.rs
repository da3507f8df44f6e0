// Cross-context request/response messaging and its in-process implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::registry::ContextId;
use crate::error::{EngineError, Result};
use crate::surface::state::SurfaceState;

#[derive(Debug, Clone, PartialEq)]
pub enum ContextRequest {
    /// Is a surface open in the target context?
    Status,
    ExportState,
    Open(Option<SurfaceState>),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContextResponse {
    Status { open: bool },
    /// `None` when no surface is open.
    State(Option<SurfaceState>),
    Ack,
}

/// Sends one request to another context and waits for its answer.
///
/// An absent or silent context yields [`EngineError::CoordinationTimeout`],
/// which callers read as "no surface there".
#[async_trait]
pub trait ContextMessenger: Send + Sync {
    async fn request(&self, target: &ContextId, request: ContextRequest) -> Result<ContextResponse>;
}

/// A request delivered to a context's inbox, with the channel for its answer.
#[derive(Debug)]
pub struct Envelope {
    pub request: ContextRequest,
    pub reply: oneshot::Sender<ContextResponse>,
}

impl Envelope {
    pub fn respond(self, response: ContextResponse) {
        // The requester may have timed out already.
        let _ = self.reply.send(response);
    }
}

/// In-process bus: one inbox per registered context.
pub struct LocalBus {
    inboxes: RwLock<HashMap<ContextId, mpsc::UnboundedSender<Envelope>>>,
    timeout: Duration,
}

impl LocalBus {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register `context` and hand back its inbox. Re-registering replaces the old inbox.
    pub fn register(&self, context: ContextId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("context {} joined the bus", context);
        self.inboxes.write().insert(context, tx);
        rx
    }

    pub fn unregister(&self, context: &ContextId) {
        if self.inboxes.write().remove(context).is_some() {
            debug!("context {} left the bus", context);
        }
    }

    pub fn is_registered(&self, context: &ContextId) -> bool {
        self.inboxes.read().contains_key(context)
    }
}

#[async_trait]
impl ContextMessenger for LocalBus {
    async fn request(&self, target: &ContextId, request: ContextRequest) -> Result<ContextResponse> {
        let unreachable = || EngineError::CoordinationTimeout(target.clone());

        let inbox = self.inboxes.read().get(target).cloned().ok_or_else(unreachable)?;
        let (reply, answer) = oneshot::channel();
        inbox
            .send(Envelope { request, reply })
            .map_err(|_| unreachable())?;

        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(unreachable()),
            Err(_) => {
                debug!("context {} did not answer within {:?}", target, self.timeout);
                Err(unreachable())
            }
        }
    }
}
