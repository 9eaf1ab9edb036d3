//! Location source: fans several providers into one sample stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::provider::{
    LocationError, PositionProvider, PositionSample, ProviderKind, SubscriptionParams,
};

/// Capacity of each provider's raw fix channel.
const PROVIDER_CHANNEL_CAPACITY: usize = 16;

/// Subscribes to every configured provider and delivers their fixes
/// through one channel. Samples from different providers are not merged.
pub struct LocationSource {
    providers: Vec<Arc<dyn PositionProvider>>,
    active: Arc<Vec<AtomicUsize>>,
}

impl LocationSource {
    pub fn new(providers: Vec<Arc<dyn PositionProvider>>) -> Self {
        let active = (0..providers.len()).map(|_| AtomicUsize::new(0)).collect();
        Self {
            providers,
            active: Arc::new(active),
        }
    }

    /// Register with every provider and forward their rate-limited fixes
    /// into `sink`.
    ///
    /// A permission failure on any provider aborts the whole subscription.
    /// Other failures skip that provider as long as one provider registered.
    pub async fn subscribe(
        &self,
        params: SubscriptionParams,
        sink: mpsc::Sender<PositionSample>,
    ) -> Result<ProviderSubscription, LocationError> {
        if self.providers.is_empty() {
            return Err(LocationError::NoProviders);
        }

        let mut subscription = ProviderSubscription::empty();
        let mut last_unavailable = None;

        for (index, provider) in self.providers.iter().enumerate() {
            let (raw_tx, raw_rx) = mpsc::channel(PROVIDER_CHANNEL_CAPACITY);

            match provider.register(&params, raw_tx).await {
                Ok(provider_task) => {
                    let relay_task = tokio::spawn(relay(
                        provider.name().to_string(),
                        raw_rx,
                        sink.clone(),
                        SampleThrottle::new(params),
                    ));
                    self.active[index].fetch_add(1, Ordering::SeqCst);
                    subscription.registrations.push(Registration {
                        index,
                        name: provider.name().to_string(),
                        kind: provider.kind(),
                        tasks: [provider_task, relay_task],
                        active: Arc::clone(&self.active),
                    });
                    info!(provider = provider.name(), kind = %provider.kind(), "Provider registered");
                }
                Err(e @ LocationError::PermissionDenied { .. }) => {
                    error!(provider = provider.name(), error = %e, "Provider registration refused");
                    // Dropping the partial subscription releases what was registered.
                    return Err(e);
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Skipping unavailable provider");
                    last_unavailable = Some(e);
                }
            }
        }

        if subscription.registrations.is_empty() {
            return Err(last_unavailable.unwrap_or(LocationError::NoProviders));
        }

        Ok(subscription)
    }

    /// Release a subscription and wait until its provider tasks are gone,
    /// so sockets they held can be bound again. Safe to call on an already
    /// released one.
    pub async fn unsubscribe(&self, subscription: &mut ProviderSubscription) {
        subscription.release_and_wait().await;
    }

    /// Live registrations held against the named provider.
    pub fn active_subscriptions(&self, provider: &str) -> usize {
        self.providers
            .iter()
            .position(|p| p.name() == provider)
            .map(|i| self.active[i].load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

struct Registration {
    index: usize,
    name: String,
    kind: ProviderKind,
    tasks: [JoinHandle<()>; 2],
    active: Arc<Vec<AtomicUsize>>,
}

/// Ownership handle for the provider registrations of one session.
///
/// Released exactly once: explicitly through [`release`](Self::release),
/// or on drop.
pub struct ProviderSubscription {
    registrations: Vec<Registration>,
    released: bool,
}

impl ProviderSubscription {
    fn empty() -> Self {
        Self {
            registrations: Vec::new(),
            released: false,
        }
    }

    /// Stop every provider task. Idempotent.
    pub fn release(&mut self) {
        self.abort_all();
    }

    /// Like [`release`](Self::release), then wait for the aborted tasks to
    /// be dropped.
    pub async fn release_and_wait(&mut self) {
        for task in self.abort_all() {
            // Cancelled is the expected outcome.
            let _ = task.await;
        }
    }

    fn abort_all(&mut self) -> Vec<JoinHandle<()>> {
        if self.released {
            return Vec::new();
        }
        self.released = true;

        let mut aborted = Vec::with_capacity(self.registrations.len() * 2);
        for registration in self.registrations.drain(..) {
            for task in registration.tasks {
                task.abort();
                aborted.push(task);
            }
            registration.active[registration.index].fetch_sub(1, Ordering::SeqCst);
            debug!(provider = %registration.name, kind = %registration.kind, "Provider released");
        }
        aborted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Names of the providers this subscription holds.
    pub fn providers(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }
}

impl Drop for ProviderSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ProviderSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSubscription")
            .field("providers", &self.providers())
            .field("released", &self.released)
            .finish()
    }
}

/// Drops samples that arrive sooner or closer than the subscription allows.
struct SampleThrottle {
    params: SubscriptionParams,
    last: Option<(Instant, PositionSample)>,
}

impl SampleThrottle {
    fn new(params: SubscriptionParams) -> Self {
        Self { params, last: None }
    }

    fn admit(&mut self, sample: &PositionSample, now: Instant) -> bool {
        if let Some((at, previous)) = &self.last {
            if now.duration_since(*at) < self.params.min_interval {
                return false;
            }
            if previous.distance_to(sample) < self.params.min_distance_m {
                return false;
            }
        }
        self.last = Some((now, sample.clone()));
        true
    }
}

async fn relay(
    provider: String,
    mut raw: mpsc::Receiver<PositionSample>,
    sink: mpsc::Sender<PositionSample>,
    mut throttle: SampleThrottle,
) {
    while let Some(sample) = raw.recv().await {
        if !sample.is_valid() {
            debug!(provider = %provider, lat = sample.latitude, lon = sample.longitude, "Discarding invalid fix");
            continue;
        }
        if !throttle.admit(&sample, Instant::now()) {
            trace!(provider = %provider, "Fix suppressed by rate limit");
            continue;
        }
        match sink.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(provider = %provider, "Sample queue full, dropping fix");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!(provider = %provider, "Provider relay finished");
}
