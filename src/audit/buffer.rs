use parking_lot::Mutex;
use std::sync::Arc;

use super::model::CapturedEvent;

/// Append-only event buffer of one audit session.
#[derive(Clone, Debug, Default)]
pub struct EventBuffer(Arc<Mutex<Vec<CapturedEvent>>>);

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: CapturedEvent) {
        self.0.lock().push(event);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Copy of everything recorded so far, in arrival order.
    pub fn snapshot(&self) -> Vec<CapturedEvent> {
        self.0.lock().clone()
    }

    pub fn take(&self) -> Vec<CapturedEvent> {
        std::mem::take(&mut *self.0.lock())
    }
}
