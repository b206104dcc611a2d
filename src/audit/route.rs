use parking_lot::RwLock;
use std::sync::Arc;

/// Label of the route being visited, shared by the walker (writer) and the capture task (reader).
///
/// Both sides touch it synchronously, without an await in between, so an event is tagged with
/// whatever label was set when the capture task handled it.
#[derive(Clone, Debug, Default)]
pub struct CurrentRoute(Arc<RwLock<Option<String>>>);

impl CurrentRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, label: &str) {
        *self.0.write() = Some(label.to_string());
    }

    pub fn clear(&self) {
        self.0.write().take();
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }
}
