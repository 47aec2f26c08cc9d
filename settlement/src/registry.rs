//! Rail registry: rail kind → adapter
//!
//! Binding is administrative. Lookups clone the adapter `Arc` out under a read lock,
//! so no registry lock is held across an await.

use crate::{adapter::RailAdapter, Error, Result};
use parking_lot::RwLock;
use rail_core::{
    AccessControl, EventBus, Principal, RailKind, Role, SettlementEvent, SharedClock,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Adapter bindings
#[derive(Debug)]
pub struct RailRegistry {
    adapters: RwLock<HashMap<RailKind, Arc<dyn RailAdapter>>>,
    access: AccessControl,
    events: EventBus,
    clock: SharedClock,
}

impl RailRegistry {
    /// Empty registry
    pub fn new(access: AccessControl, events: EventBus, clock: SharedClock) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            access,
            events,
            clock,
        }
    }

    /// Bind an adapter to its rail; fails if the rail is already bound
    pub fn set(&self, caller: &Principal, adapter: Arc<dyn RailAdapter>) -> Result<()> {
        self.access.require(caller, Role::Admin)?;
        let rail = adapter.kind();
        {
            let mut adapters = self.adapters.write();
            if adapters.contains_key(&rail) {
                return Err(Error::RailAlreadyBound(rail));
            }
            adapters.insert(rail, adapter.clone());
        }
        self.announce(rail, adapter.name(), false);
        Ok(())
    }

    /// Bind or replace. Records are not migrated; the new adapter sees what its store holds.
    pub fn rebind(&self, caller: &Principal, adapter: Arc<dyn RailAdapter>) -> Result<bool> {
        self.access.require(caller, Role::Admin)?;
        let rail = adapter.kind();
        let replaced = self
            .adapters
            .write()
            .insert(rail, adapter.clone())
            .is_some();
        self.announce(rail, adapter.name(), replaced);
        Ok(replaced)
    }

    /// Remove a binding
    pub fn unbind(&self, caller: &Principal, rail: &RailKind) -> Result<Arc<dyn RailAdapter>> {
        self.access.require(caller, Role::Admin)?;
        let adapter = self
            .adapters
            .write()
            .remove(rail)
            .ok_or(Error::UnknownRail(*rail))?;
        info!(rail = %rail, name = adapter.name(), "Rail unbound");
        Ok(adapter)
    }

    /// Adapter for `rail`
    pub fn get(&self, rail: &RailKind) -> Result<Arc<dyn RailAdapter>> {
        self.adapters
            .read()
            .get(rail)
            .cloned()
            .ok_or(Error::UnknownRail(*rail))
    }

    /// Bound rails
    pub fn kinds(&self) -> Vec<RailKind> {
        let mut kinds: Vec<_> = self.adapters.read().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// All bound adapters
    pub fn adapters(&self) -> Vec<Arc<dyn RailAdapter>> {
        self.adapters.read().values().cloned().collect()
    }

    fn announce(&self, rail: RailKind, name: &str, replaced: bool) {
        info!(rail = %rail, name = name, replaced = replaced, "Rail bound");
        self.events.publish(SettlementEvent::RailBound {
            rail,
            replaced,
            at: self.clock.now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::RailContext;
    use crate::rails::NativeRail;
    use rail_core::clock::system_clock;
    use rail_core::collaborators::{InMemoryLedger, InMemoryRoles};
    use rail_core::Metrics;

    fn registry() -> RailRegistry {
        let roles = Arc::new(InMemoryRoles::new().with_role("admin", Role::Admin));
        RailRegistry::new(AccessControl::new(roles), EventBus::default(), system_clock())
    }

    fn native(name: &str) -> Arc<dyn RailAdapter> {
        Arc::new(NativeRail::new(
            name,
            Arc::new(InMemoryLedger::new()),
            RailContext::in_memory(system_clock(), EventBus::default(), Metrics::new().unwrap()),
        ))
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let registry = registry();
        let admin = Principal::new("admin");
        let rail = RailKind::from_name("native");

        assert!(matches!(registry.get(&rail), Err(Error::UnknownRail(_))));
        registry.set(&admin, native("native")).unwrap();
        assert_eq!(registry.get(&rail).unwrap().name(), "native");
        assert!(matches!(
            registry.set(&admin, native("native")),
            Err(Error::RailAlreadyBound(_))
        ));
        assert!(registry.rebind(&admin, native("native")).unwrap());

        registry.unbind(&admin, &rail).unwrap();
        assert!(registry.kinds().is_empty());
    }

    #[test]
    fn test_binding_requires_admin() {
        let registry = registry();
        assert!(registry
            .set(&Principal::new("mallory"), native("native"))
            .is_err());
        assert!(registry.kinds().is_empty());
    }
}
