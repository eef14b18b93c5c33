//! Named bus registry.
//!
//! A registry maps bus names to shared bus handles. Standalone registries
//! can be constructed freely (tests build their own); the process-wide
//! instance behind [`BusRegistry::global`] is lazily initialised and
//! thread-safe.

use crate::bus::{BusStatistics, MessageBus, RoutingConfig};
use crate::error::BusError;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// The name [`BusRegistry::default_bus`] resolves to.
pub const DEFAULT_BUS_NAME: &str = "default";

static GLOBAL: OnceLock<BusRegistry> = OnceLock::new();

/// Maps bus names to live buses.
#[derive(Default)]
pub struct BusRegistry {
    buses: RwLock<HashMap<String, Arc<MessageBus>>>,
}

impl BusRegistry {
    /// A fresh, empty registry. Use this in tests instead of the global.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static BusRegistry {
        GLOBAL.get_or_init(BusRegistry::new)
    }

    /// Creates and registers a bus. Fails if the name is taken.
    pub fn create_bus(
        &self,
        name: &str,
        config: RoutingConfig,
    ) -> Result<Arc<MessageBus>, BusError> {
        let mut buses = self.buses.write().unwrap();
        if buses.contains_key(name) {
            return Err(BusError::InvalidArgument(format!(
                "bus {name:?} already exists"
            )));
        }
        let bus = Arc::new(MessageBus::new(name, config));
        buses.insert(name.to_owned(), Arc::clone(&bus));
        Ok(bus)
    }

    /// Looks up a bus by name.
    pub fn bus(&self, name: &str) -> Option<Arc<MessageBus>> {
        self.buses.read().unwrap().get(name).cloned()
    }

    /// Drops a bus from the registry. Consumers holding the handle keep
    /// it alive until they let go.
    pub fn remove_bus(&self, name: &str) -> bool {
        self.buses.write().unwrap().remove(name).is_some()
    }

    pub fn bus_names(&self) -> Vec<String> {
        self.buses.read().unwrap().keys().cloned().collect()
    }

    /// The bus named `"default"`, created on first use.
    pub fn default_bus(&self) -> Arc<MessageBus> {
        if let Some(bus) = self.bus(DEFAULT_BUS_NAME) {
            return bus;
        }
        let mut buses = self.buses.write().unwrap();
        // Re-check: another thread may have created it meanwhile.
        if let Some(bus) = buses.get(DEFAULT_BUS_NAME) {
            return Arc::clone(bus);
        }
        let bus = Arc::new(MessageBus::new(DEFAULT_BUS_NAME, RoutingConfig::default()));
        buses.insert(DEFAULT_BUS_NAME.to_owned(), Arc::clone(&bus));
        bus
    }

    /// Statistics for every registered bus.
    pub fn all_statistics(&self) -> HashMap<String, BusStatistics> {
        self.buses
            .read()
            .unwrap()
            .iter()
            .map(|(name, bus)| (name.clone(), bus.statistics()))
            .collect()
    }
}

/// Shorthand for the global registry's default bus.
pub fn default_bus() -> Arc<MessageBus> {
    BusRegistry::global().default_bus()
}
