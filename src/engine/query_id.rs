// Query Id Generation
//
// Persistent query ids carry a number. By default the numbers count up from
// zero in execution order. A command may instead ask for the number to be
// seeded from its command-log offset, so ids stay stable however many
// commands before it failed or were skipped on another node.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::types::{Offset, QueryId};

#[derive(Debug, Default)]
struct GeneratorState {
    next: u64,
    offset_seeded: bool,
}

#[derive(Debug, Default)]
pub struct QueryIdGenerator {
    state: Mutex<GeneratorState>,
    transient: AtomicU64,
}

impl QueryIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to numbering from `offset`. Later ids count up from there.
    pub fn activate_new_generator(&self, offset: Offset) {
        let mut state = self.state.lock();
        state.next = offset;
        state.offset_seeded = true;
    }

    pub fn is_offset_seeded(&self) -> bool {
        self.state.lock().offset_seeded
    }

    /// Peek at the number the next persistent query will get
    pub fn peek_next(&self) -> u64 {
        self.state.lock().next
    }

    fn next(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next;
        state.next += 1;
        id
    }

    pub fn next_csas_id(&self, sink: &str) -> QueryId {
        QueryId::new(format!("CSAS_{}_{}", sink.to_uppercase(), self.next()))
    }

    pub fn next_ctas_id(&self, sink: &str) -> QueryId {
        QueryId::new(format!("CTAS_{}_{}", sink.to_uppercase(), self.next()))
    }

    pub fn next_insert_id(&self) -> QueryId {
        QueryId::new(format!("InsertQuery_{}", self.next()))
    }

    /// Transient ids have their own sequence so they never shift persistent ones
    pub fn next_transient_id(&self, source: &str) -> QueryId {
        let n = self.transient.fetch_add(1, Ordering::Relaxed);
        QueryId::new(format!("transient_{}_{}", source.to_uppercase(), n))
    }
}
