// Server state assembly. One initialization step builds the store, the
// event bus on top of it, and the hub + push registry subscribed to the bus
// (strict DAG — neither ever calls into task mutation paths). Background
// tasks share a single stop flag flipped on shutdown.

use memoro_core::bus::{self, EventBus};
use memoro_core::config::Config;
use memoro_core::error::Result;
use memoro_core::hub::{self, Hub};
use memoro_core::push::{self, PushRegistry};
use memoro_core::store::TaskStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub bus: Arc<EventBus>,
    pub hub: Arc<Hub>,
    pub push: Arc<PushRegistry>,
    pub stop: Arc<AtomicBool>,
}

impl AppState {
    pub fn build(config: &Config) -> Result<AppState> {
        let store = Arc::new(TaskStore::open(&config.db_path()?)?);
        let bus = Arc::new(EventBus::new(Some(Arc::clone(&store)), config.bus.clone()));
        let push = PushRegistry::new(Arc::clone(&bus), config.push.clone());
        let hub = Hub::new(Arc::clone(&bus), config.hub.clone(), Some(push.dedup()));
        let stop = Arc::new(AtomicBool::new(false));

        AppState { store, bus, hub, push, stop }.spawn_background()
    }

    /// In-memory state for tests.
    pub fn build_in_memory(config: &Config) -> Result<AppState> {
        let store = Arc::new(TaskStore::open_in_memory()?);
        let bus = Arc::new(EventBus::new(Some(Arc::clone(&store)), config.bus.clone()));
        let push = PushRegistry::new(Arc::clone(&bus), config.push.clone());
        let hub = Hub::new(Arc::clone(&bus), config.hub.clone(), Some(push.dedup()));
        let stop = Arc::new(AtomicBool::new(false));

        AppState { store, bus, hub, push, stop }.spawn_background()
    }

    fn spawn_background(self) -> Result<AppState> {
        bus::spawn_maintenance(Arc::clone(&self.bus), Arc::clone(&self.stop));
        hub::spawn_dispatcher(Arc::clone(&self.hub), Arc::clone(&self.stop));
        push::spawn_dispatcher(Arc::clone(&self.push), Arc::clone(&self.stop));
        push::spawn_health_prober(Arc::clone(&self.push), Arc::clone(&self.stop));
        Ok(self)
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
