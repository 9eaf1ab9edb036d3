//! Provider fed by the host application.
//!
//! Platforms that own the location hardware (a mobile shell, a desktop
//! bridge) push fixes in through an [`ExternalFeed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use super::provider::{
    LocationError, PositionProvider, PositionSample, ProviderKind, SubscriptionParams,
};

const FEED_CAPACITY: usize = 32;

/// Position provider backed by fixes pushed from outside the crate.
pub struct ExternalProvider {
    name: String,
    feed: ExternalFeed,
}

impl ExternalProvider {
    /// Create a provider and the feed that drives it.
    pub fn named(name: impl Into<String>) -> (Self, ExternalFeed) {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        let feed = ExternalFeed {
            tx,
            authorized: Arc::new(AtomicBool::new(true)),
        };
        (
            Self {
                name: name.into(),
                feed: feed.clone(),
            },
            feed,
        )
    }
}

#[async_trait]
impl PositionProvider for ExternalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::External
    }

    async fn register(
        &self,
        _params: &SubscriptionParams,
        fixes: mpsc::Sender<PositionSample>,
    ) -> Result<JoinHandle<()>, LocationError> {
        if !self.feed.authorized.load(Ordering::SeqCst) {
            return Err(LocationError::PermissionDenied {
                provider: self.name.clone(),
                reason: "host has not granted location access".into(),
            });
        }

        // Subscribe before returning so fixes pushed right after
        // registration are not lost.
        let mut rx = self.feed.tx.subscribe();
        let name = self.name.clone();
        Ok(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(sample) => {
                        if fixes.send(sample).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(provider = %name, skipped, "External feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }
}

/// Handle the host uses to push fixes and report authorization changes.
#[derive(Clone)]
pub struct ExternalFeed {
    tx: broadcast::Sender<PositionSample>,
    authorized: Arc<AtomicBool>,
}

impl ExternalFeed {
    /// Deliver a fix. Returns false when nothing is subscribed.
    pub fn push(&self, sample: PositionSample) -> bool {
        self.tx.send(sample).is_ok()
    }

    /// Record whether the host currently grants location access.
    /// Takes effect on the next registration.
    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    /// Number of live registrations listening to this feed.
    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}
