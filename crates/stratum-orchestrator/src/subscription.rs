use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stratum_common::ServiceInstance;
use tracing::{debug, warn};

/// Receives the matching instance list on subscribe and after every change.
pub type SubscriptionCallback = Arc<dyn Fn(&[ServiceInstance]) + Send + Sync>;

/// Extra predicate narrowing which instances a subscriber sees.
pub type InstanceFilter = Arc<dyn Fn(&ServiceInstance) -> bool + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Optional narrowing applied to a subscription.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub version: Option<String>,
    pub filter: Option<InstanceFilter>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ServiceInstance) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("version", &self.version)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

struct Subscription {
    id: SubscriptionId,
    service_name: String,
    options: SubscribeOptions,
    callback: SubscriptionCallback,
    /// Active flag, held for the whole of a delivery. Reentrant so a callback
    /// may unsubscribe itself.
    active: ReentrantMutex<Cell<bool>>,
}

impl Subscription {
    /// Filters `instances` and hands them to the callback unless unsubscribed.
    ///
    /// A panicking callback is logged and otherwise ignored.
    fn deliver(&self, mut instances: Vec<ServiceInstance>) {
        if let Some(filter) = &self.options.filter {
            instances.retain(|i| filter(i));
        }
        let active = self.active.lock();
        if !active.get() {
            return;
        }
        let callback = &self.callback;
        if catch_unwind(AssertUnwindSafe(|| callback(&instances))).is_err() {
            warn!(
                subscription = %self.id,
                service = %self.service_name,
                "Subscriber callback panicked"
            );
        }
    }

    /// Blocks until any in-flight delivery has returned, then disables delivery.
    fn deactivate(&self) {
        self.active.lock().set(false);
    }
}

/// Publish/subscribe fan-out keyed by service name.
///
/// Each publish works on a snapshot of the subscriber list, so callbacks may
/// subscribe or unsubscribe without disturbing the delivery in progress.
pub struct SubscriptionHub {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Adds a subscriber and delivers `initial` to it.
    ///
    /// `initial` must be the current unfiltered view for the subscriber's
    /// service name and version.
    pub fn subscribe(
        &self,
        service_name: &str,
        callback: SubscriptionCallback,
        options: SubscribeOptions,
        initial: Vec<ServiceInstance>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            service_name: service_name.to_string(),
            options,
            callback,
            active: ReentrantMutex::new(Cell::new(true)),
        });
        self.subscriptions.lock().push(subscription.clone());
        debug!(subscription = %id, service = %service_name, "Subscribed");
        subscription.deliver(initial);
        id
    }

    /// Stops delivery to `id`. Returns false when it was not subscribed.
    ///
    /// Waits for a delivery to `id` running on another thread, so the callback
    /// never runs after this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscriptions = self.subscriptions.lock();
            match subscriptions.iter().position(|s| s.id == id) {
                Some(index) => subscriptions.remove(index),
                None => return false,
            }
        };
        removed.deactivate();
        debug!(subscription = %id, service = %removed.service_name, "Unsubscribed");
        true
    }

    /// Re-delivers to every subscriber of `service_name`.
    ///
    /// `view` produces the unfiltered instance list for a requested version
    /// (`None` meaning all versions).
    pub fn publish<F>(&self, service_name: &str, view: F)
    where
        F: Fn(Option<&str>) -> Vec<ServiceInstance>,
    {
        let targets: Vec<Arc<Subscription>> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.service_name == service_name)
            .cloned()
            .collect();

        for subscription in targets {
            let instances = view(subscription.options.version.as_deref());
            subscription.deliver(instances);
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    /// Drops every subscription; none of them receives further deliveries.
    pub fn clear(&self) {
        let drained: Vec<_> = self.subscriptions.lock().drain(..).collect();
        for subscription in drained {
            subscription.deactivate();
        }
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}
