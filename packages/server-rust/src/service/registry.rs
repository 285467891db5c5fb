use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use super::descriptor::ServiceDescriptor;
use super::dispatcher::DispatchError;
use super::execution::panic_message;
use super::runtime::{ServiceRuntime, ServiceStats};

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry of the services a terminal serves.
///
/// Three lookups are maintained:
/// - **By id** (`descriptors`): service id -> descriptor
/// - **By method** (`methods`): method -> candidate service ids
/// - **Runtime** (`runtimes`): service id -> scheduling state
///
/// Registration and deregistration are serialized by `writes` so the three
/// maps never disagree; dispatch only reads.
pub struct ServiceRegistry {
    descriptors: DashMap<String, Arc<ServiceDescriptor>>,
    methods: DashMap<String, BTreeSet<String>>,
    runtimes: DashMap<String, Arc<ServiceRuntime>>,
    writes: Mutex<()>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptors: DashMap::new(),
            methods: DashMap::new(),
            runtimes: DashMap::new(),
            writes: Mutex::new(()),
        }
    }

    /// Register a service, replacing any previous service with the same id.
    ///
    /// A fresh runtime context is always created. Requests already bound to a
    /// replaced runtime keep it and drain through it.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Option<Arc<ServiceDescriptor>> {
        let _guard = self.writes.lock();
        let service_id = descriptor.service_id().to_string();
        let method = descriptor.method().to_string();
        let options = descriptor.options();
        let descriptor = Arc::new(descriptor);

        let replaced = self
            .descriptors
            .insert(service_id.clone(), Arc::clone(&descriptor));
        if let Some(old) = &replaced {
            if old.method() != method {
                self.unindex(old.method(), &service_id);
            }
        }
        self.methods
            .entry(method.clone())
            .or_default()
            .insert(service_id.clone());
        self.runtimes.insert(
            service_id.clone(),
            Arc::new(ServiceRuntime::new(descriptor)),
        );

        info!(
            service_id = %service_id,
            method = %method,
            concurrency = %options.concurrency,
            capacity = %options.capacity,
            replaced = replaced.is_some(),
            "service registered"
        );
        replaced
    }

    /// Remove a service. Its runtime context is left in place so requests
    /// already bound to it finish normally.
    pub fn deregister(&self, service_id: &str) -> Option<Arc<ServiceDescriptor>> {
        let _guard = self.writes.lock();
        let (_, removed) = self.descriptors.remove(service_id)?;
        self.unindex(removed.method(), service_id);
        info!(service_id = %service_id, method = %removed.method(), "service removed");
        Some(removed)
    }

    /// Service ids registered for `method`, in id order.
    #[must_use]
    pub fn candidates(&self, method: &str) -> BTreeSet<String> {
        self.methods
            .get(method)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Picks the single service for `method` whose validator accepts `payload`.
    ///
    /// Every candidate's validator runs, so two accepting services are always
    /// reported as ambiguous. A validator that panics counts as not accepting.
    ///
    /// # Errors
    ///
    /// Returns the routing rejection to send back to the caller.
    pub fn resolve(
        &self,
        method: &str,
        payload: &Value,
    ) -> Result<Arc<ServiceRuntime>, DispatchError> {
        let candidates = self.candidates(method);
        if candidates.is_empty() {
            return Err(DispatchError::MethodNotFound);
        }

        let accepted: Vec<Arc<ServiceDescriptor>> = candidates
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|descriptor| validate(descriptor, payload))
            .collect();
        let target = match accepted.as_slice() {
            [] => return Err(DispatchError::NoMatchingService),
            [target] => target,
            _ => return Err(DispatchError::AmbiguousService),
        };

        self.runtime(target.service_id())
            .ok_or(DispatchError::ServiceNotFound)
    }

    /// Retrieve a descriptor by service id.
    pub fn get(&self, service_id: &str) -> Option<Arc<ServiceDescriptor>> {
        self.descriptors
            .get(service_id)
            .map(|entry| entry.value().clone())
    }

    /// Retrieve a runtime context by service id.
    pub fn runtime(&self, service_id: &str) -> Option<Arc<ServiceRuntime>> {
        self.runtimes
            .get(service_id)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of every registered descriptor, keyed by service id.
    #[must_use]
    pub fn services(&self) -> HashMap<String, Arc<ServiceDescriptor>> {
        self.descriptors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn stats(&self, service_id: &str) -> Option<ServiceStats> {
        self.runtime(service_id).map(|rt| rt.stats())
    }

    /// Every runtime context, including those of removed services that may
    /// still hold queued requests.
    #[must_use]
    pub fn runtimes(&self) -> Vec<Arc<ServiceRuntime>> {
        self.runtimes
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn unindex(&self, method: &str, service_id: &str) {
        let now_empty = self.methods.get_mut(method).is_some_and(|mut ids| {
            ids.remove(service_id);
            ids.is_empty()
        });
        if now_empty {
            self.methods.remove(method);
        }
    }
}

fn validate(descriptor: &ServiceDescriptor, payload: &Value) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| descriptor.accepts(payload))) {
        Ok(accepted) => accepted,
        Err(panic) => {
            warn!(
                service_id = %descriptor.service_id(),
                error = %panic_message(&*panic),
                "validator panicked"
            );
            false
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
