//! The fetch pipeline's service object.

use std::sync::Arc;

use http::StatusCode;
use nav_cache::{BfCache, PrefetchStore};
use nav_core::{Clock, SystemClock};

use crate::decode::PayloadDecoder;
use crate::error::FetchError;
use crate::protocol::{DEPLOYMENT_ID_HEADER, NAV_CONTENT_TYPE};
use crate::transport::{FetchResponse, Transport};

/// Issues prefetch requests and writes their results into the store.
///
/// All suspension points of the cache live here; the store itself never
/// awaits. Orchestration entry points resolve every failure as a rejected
/// entry rather than returning it.
pub struct PrefetchFetcher {
    pub(crate) store: Arc<PrefetchStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) decoder: Arc<dyn PayloadDecoder>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) bfcache: Option<Arc<dyn BfCache>>,
}

impl PrefetchFetcher {
    /// Create a fetcher over the given store and collaborators.
    pub fn new(
        store: Arc<PrefetchStore>,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn PayloadDecoder>,
    ) -> Self {
        Self {
            store,
            transport,
            decoder,
            clock: Arc::new(SystemClock),
            bfcache: None,
        }
    }

    /// Use a custom clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach a back/forward cache.
    pub fn with_bfcache(mut self, bfcache: Arc<dyn BfCache>) -> Self {
        self.bfcache = Some(bfcache);
        self
    }

    /// The store this fetcher writes into.
    pub fn store(&self) -> &Arc<PrefetchStore> {
        &self.store
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Shared response validation: status, content type, and deployment id.
    pub(crate) fn validate_response(&self, response: &FetchResponse) -> Result<(), FetchError> {
        if response.status == StatusCode::NO_CONTENT {
            return Err(FetchError::IntentionalMiss);
        }
        if !response.ok() {
            return Err(FetchError::Status(response.status));
        }
        let content_type = response.header("content-type");
        if !content_type.is_some_and(|ct| ct.starts_with(NAV_CONTENT_TYPE)) {
            return Err(FetchError::ContentType(content_type.map(str::to_string)));
        }
        if let Some(deployment) = response.header(DEPLOYMENT_ID_HEADER) {
            let expected = &self.store.config().build_id;
            if deployment != expected {
                return Err(FetchError::DeploymentMismatch {
                    expected: expected.clone(),
                    got: deployment.to_string(),
                });
            }
        }
        Ok(())
    }
}
