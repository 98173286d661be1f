//! RAII guard that releases an admission slot when dropped.

use std::sync::Arc;

use super::admission::SlotTicket;
use super::ServiceInner;
use crate::transport::Session;

/// A granted concurrency slot. Dropping it releases the slot and lets the
/// next queued fetch in.
pub(crate) struct Slot {
    service: Arc<ServiceInner>,
    ticket: SlotTicket,
}

impl Slot {
    pub(crate) fn new(service: Arc<ServiceInner>, ticket: SlotTicket) -> Self {
        Self { service, ticket }
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.ticket.session
    }

    pub(crate) fn generation(&self) -> u64 {
        self.ticket.generation
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.service
            .release(&self.ticket.host, self.ticket.generation);
    }
}
