use std::any::{type_name, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tether_core::Principal;

use super::blueprint::ServiceInstance;

// ---------------------------------------------------------------------------
// ServiceProvider
// ---------------------------------------------------------------------------

/// Type-keyed lookup of the service instances that back registered contracts.
///
/// Each contract resolves its instance by `TypeId` on every call, so an
/// instance can be swapped by registering a new one of the same type.
#[derive(Default)]
pub struct ServiceProvider {
    by_type: DashMap<TypeId, ServiceInstance>,
    names: DashMap<TypeId, &'static str>,
}

impl ServiceProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the instance for `T`.
    pub fn register<T: Send + Sync + 'static>(&self, instance: Arc<T>) {
        let id = TypeId::of::<T>();
        self.by_type.insert(id, instance);
        self.names.insert(id, type_name::<T>());
    }

    /// Retrieve an instance by its concrete type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Retrieve a type-erased instance by `TypeId`.
    #[must_use]
    pub fn resolve(&self, id: TypeId) -> Option<ServiceInstance> {
        self.by_type.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn contains(&self, id: TypeId) -> bool {
        self.by_type.contains_key(&id)
    }

    /// Type names of all registered instances, for diagnostics.
    #[must_use]
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.names.iter().map(|entry| *entry.value()).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("types", &self.registered_types())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Exposes the authenticated principal of the current connection.
///
/// Implemented by the transport; the dispatch core never validates
/// credentials itself.
pub trait IdentityAccessor: Send + Sync {
    fn principal(&self) -> Option<Principal>;
}

/// Identity that can be set once the transport authenticates the caller.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    principal: RwLock<Option<Principal>>,
}

impl StaticIdentity {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn authenticated(principal: Principal) -> Self {
        Self {
            principal: RwLock::new(Some(principal)),
        }
    }

    pub fn set(&self, principal: Option<Principal>) {
        *self.principal.write() = principal;
    }
}

impl IdentityAccessor for StaticIdentity {
    fn principal(&self) -> Option<Principal> {
        self.principal.read().clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Counter(AtomicU32);
    struct Other;

    #[test]
    fn register_and_get_by_type() {
        let provider = ServiceProvider::new();
        provider.register(Arc::new(Counter(AtomicU32::new(3))));

        let counter = provider.get::<Counter>().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
        assert!(provider.get::<Other>().is_none());
        assert!(provider.contains(TypeId::of::<Counter>()));
    }

    #[test]
    fn erased_instances_downcast_to_the_registered_type() {
        let provider = ServiceProvider::new();
        provider.register(Arc::new(Other));

        let erased = provider.resolve(TypeId::of::<Other>()).unwrap();
        assert!(erased.downcast::<Other>().is_ok());
        assert!(provider.resolve(TypeId::of::<Counter>()).is_none());
    }

    #[test]
    fn re_registering_replaces_the_instance() {
        let provider = ServiceProvider::new();
        provider.register(Arc::new(Counter(AtomicU32::new(1))));
        provider.register(Arc::new(Counter(AtomicU32::new(2))));

        assert_eq!(provider.get::<Counter>().unwrap().0.load(Ordering::SeqCst), 2);
        assert_eq!(provider.registered_types().len(), 1);
    }

    #[test]
    fn static_identity_can_be_updated() {
        let identity = StaticIdentity::anonymous();
        assert!(identity.principal().is_none());

        identity.set(Some(Principal::new("alice")));
        assert_eq!(identity.principal().unwrap().id, "alice");
    }
}
