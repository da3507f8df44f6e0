// Cache-proxy delivery contract and the resource handles it hands out.

use tracing::debug;

use crate::error::Result;
use crate::source::traits::MediaCandidate;

type ReleaseFn = Box<dyn FnOnce(&str) + Send>;

/// A locally created resource backing a media source (a proxy registration).
///
/// Owned by exactly one session. The release hook runs exactly once: either
/// through [`ResourceHandle::release`] or when the handle is dropped.
pub struct ResourceHandle {
    id: String,
    url: String,
    release: Option<ReleaseFn>,
}

impl ResourceHandle {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        release: impl FnOnce(&str) + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("releasing resource handle {}", self.id);
            release(&self.id);
        }
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Second-stage delivery path used when a surface cannot load a primary URL.
pub trait ProxyDelivery: Send + Sync {
    fn open_proxy_stream(&self, item: &MediaCandidate) -> Result<ResourceHandle>;
}
