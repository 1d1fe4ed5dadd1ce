//! Bounded journal of arena lifecycle events.
//!
//! Instances record what they did (regions mapped and released, requests
//! that ran dry) into a fixed-size lock-free ring. When the ring is full the
//! oldest entries are overwritten.
//!
//! Events and their diagnostics are collected in an [`EventBuffer`] on the
//! stack while an instance lock is held and flushed only after the lock is
//! dropped: the journal's first use allocates, and allocating under an
//! instance lock would deadlock when this crate is the global allocator.

use std::sync::OnceLock;

use crossbeam_queue::ArrayQueue;

use super::emit::{emit_unguarded, EmitGuard};
use super::kind::Diagnostic;

/// Entries kept before the oldest are overwritten.
pub const JOURNAL_CAPACITY: usize = 256;

static JOURNAL: OnceLock<ArrayQueue<ArenaEvent>> = OnceLock::new();

/// Something an arena did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaEvent {
    /// An instance came up with `regions` regions mapped.
    InstanceCreated { instance: u64, regions: usize },
    /// An instance was torn down and all its regions unmapped.
    InstanceDestroyed { instance: u64 },
    /// A region was added by growth.
    RegionMapped { instance: u64, region: u64, bytes: usize },
    /// An emptied region was unmapped by the shrink policy.
    RegionReleased { instance: u64, region: u64, bytes: usize },
    /// A request failed after growing and retrying.
    Exhausted { instance: u64, requested: usize },
}

impl ArenaEvent {
    /// Instance the event belongs to.
    pub fn instance(&self) -> u64 {
        match *self {
            ArenaEvent::InstanceCreated { instance, .. }
            | ArenaEvent::InstanceDestroyed { instance }
            | ArenaEvent::RegionMapped { instance, .. }
            | ArenaEvent::RegionReleased { instance, .. }
            | ArenaEvent::Exhausted { instance, .. } => instance,
        }
    }
}

fn journal() -> &'static ArrayQueue<ArenaEvent> {
    JOURNAL.get_or_init(|| ArrayQueue::new(JOURNAL_CAPACITY))
}

/// Journal one event immediately. Call with no lock held.
pub(crate) fn record(event: ArenaEvent) {
    if let Some(_guard) = EmitGuard::enter() {
        journal().force_push(event);
    }
}

/// Take every journaled event, oldest first.
pub fn drain_events() -> Vec<ArenaEvent> {
    let journal = journal();
    let mut events = Vec::with_capacity(journal.len());
    while let Some(event) = journal.pop() {
        events.push(event);
    }
    events
}

const MAX_PENDING_EVENTS: usize = 8;
const MAX_PENDING_DIAGNOSTICS: usize = 4;

#[derive(Clone, Copy)]
struct PendingDiagnostic {
    diag: &'static Diagnostic,
    instance: u64,
    bytes: usize,
}

/// Stack buffer for events and diagnostics raised under an instance lock.
pub(crate) struct EventBuffer {
    events: [Option<ArenaEvent>; MAX_PENDING_EVENTS],
    diagnostics: [Option<PendingDiagnostic>; MAX_PENDING_DIAGNOSTICS],
    event_count: usize,
    diagnostic_count: usize,
}

impl EventBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            events: [None; MAX_PENDING_EVENTS],
            diagnostics: [None; MAX_PENDING_DIAGNOSTICS],
            event_count: 0,
            diagnostic_count: 0,
        }
    }

    pub(crate) fn push(&mut self, event: ArenaEvent) {
        if let Some(slot) = self.events.get_mut(self.event_count) {
            *slot = Some(event);
            self.event_count += 1;
        }
    }

    pub(crate) fn diagnose(&mut self, diag: &'static Diagnostic, instance: u64, bytes: usize) {
        if let Some(slot) = self.diagnostics.get_mut(self.diagnostic_count) {
            *slot = Some(PendingDiagnostic {
                diag,
                instance,
                bytes,
            });
            self.diagnostic_count += 1;
        }
    }

    /// Codes of the diagnostics waiting to be flushed, in order.
    #[cfg(test)]
    pub(crate) fn pending_codes(&self) -> Vec<&'static str> {
        self.diagnostics.iter().flatten().map(|p| p.diag.code).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.event_count == 0 && self.diagnostic_count == 0
    }

    /// Journal the events and emit the diagnostics. Call with no lock held.
    pub(crate) fn flush(self) {
        if self.is_empty() {
            return;
        }
        // Anything raised while flushing (the journal allocating, a logger
        // allocating) is dropped rather than recursing.
        let Some(_guard) = EmitGuard::enter() else {
            return;
        };

        let journal = journal();
        for event in self.events.iter().flatten() {
            journal.force_push(*event);
        }
        for pending in self.diagnostics.iter().flatten() {
            emit_unguarded(
                pending.diag,
                Some(format_args!("instance {}: {} bytes", pending.instance, pending.bytes)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::kind::TA003;

    // Instance ids far above anything the tests allocate.
    const ID: u64 = u64::MAX - 7;

    #[test]
    fn test_buffer_flushes_into_journal() {
        let mut buffer = EventBuffer::new();
        assert!(buffer.is_empty());
        buffer.push(ArenaEvent::RegionMapped {
            instance: ID,
            region: 1,
            bytes: 4096,
        });
        buffer.push(ArenaEvent::Exhausted {
            instance: ID,
            requested: 64,
        });
        buffer.diagnose(&TA003, ID, 64);
        buffer.flush();

        let ours: Vec<ArenaEvent> = drain_events()
            .into_iter()
            .filter(|e| e.instance() == ID)
            .collect();
        assert_eq!(ours.len(), 2);
        assert!(matches!(ours[0], ArenaEvent::RegionMapped { region: 1, .. }));
    }

    #[test]
    fn test_buffer_drops_overflow() {
        let mut buffer = EventBuffer::new();
        for region in 0..(MAX_PENDING_EVENTS as u64 + 3) {
            buffer.push(ArenaEvent::RegionReleased {
                instance: ID - 1,
                region,
                bytes: 0,
            });
        }
        assert_eq!(buffer.event_count, MAX_PENDING_EVENTS);
    }
}
