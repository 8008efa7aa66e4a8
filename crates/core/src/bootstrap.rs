//! Deferred start: run a loader once consent shows up, either already in the
//! cookie or later as a consent update on the data layer.

use std::sync::{Arc, Mutex};

use crate::{
    consent::ConsentGate,
    events::{DataLayer, DataLayerEntry, Subscription},
    page::Page,
};

pub const CONSENT_UPDATE_EVENTS: [&str; 2] = ["consent_update", "ll_consent_update"];

type Loader = Box<dyn FnOnce() + Send>;

/// Watches for consent and fires its loader at most once.
pub struct ConsentBootstrap {
    inner: Arc<BootstrapInner>,
    subscription: Option<Subscription>,
}

struct BootstrapInner {
    loader: Mutex<Option<Loader>>,
}

impl BootstrapInner {
    fn load(&self, reason: &str) {
        let loader = self.loader.lock().expect("bootstrap loader poisoned").take();
        if let Some(loader) = loader {
            tracing::info!(reason, "consent granted, loading analytics");
            loader();
        }
    }

    fn is_loaded(&self) -> bool {
        self.loader
            .lock()
            .expect("bootstrap loader poisoned")
            .is_none()
    }
}

/// True for `{event: "consent_update", analytics_storage: "granted"}`.
pub fn is_consent_grant(entry: &DataLayerEntry) -> bool {
    let is_update = entry
        .str_field("event")
        .is_some_and(|event| CONSENT_UPDATE_EVENTS.contains(&event));
    is_update
        && entry
            .str_field("analytics_storage")
            .is_some_and(|state| state.trim().eq_ignore_ascii_case("granted"))
}

impl ConsentBootstrap {
    /// Checks the consent cookie, then entries already on the data layer,
    /// then subscribes for future ones. Performs no I/O itself.
    pub fn install(
        page: &Page,
        data_layer: &DataLayer,
        loader: impl FnOnce() + Send + 'static,
    ) -> Self {
        let inner = Arc::new(BootstrapInner {
            loader: Mutex::new(Some(Box::new(loader))),
        });

        if ConsentGate::from_page(page).is_analytics_allowed() {
            inner.load("cookie");
        }
        if !inner.is_loaded() && data_layer.entries().iter().any(|e| is_consent_grant(e)) {
            inner.load("data layer history");
        }

        let subscription = if inner.is_loaded() {
            None
        } else {
            let watcher = Arc::clone(&inner);
            Some(data_layer.on(move |entry| {
                if is_consent_grant(entry) {
                    watcher.load("consent update");
                }
            }))
        };

        Self {
            inner,
            subscription,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.is_loaded()
    }

    /// Stop watching the data layer.
    pub fn uninstall(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}
