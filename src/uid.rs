//! Request id generation.
//!
//! One generator is owned by the release coordinator and lent to the merger by
//! `&mut`; there is no process-wide counter.

use crate::request::{RequestUid, TriggerRequest};

/// Hands out final output ids and provisional merge ids from separate namespaces.
#[derive(Debug, Clone)]
pub struct UidGenerator {
    next_final: u64,
    next_provisional: u64,
}

impl UidGenerator {
    /// Creates a generator whose first final id is `first_uid`.
    #[must_use]
    pub const fn new(first_uid: u64) -> Self {
        Self {
            next_final: first_uid,
            next_provisional: 0,
        }
    }

    /// Next provisional id, used for intermediate merges.
    pub fn next_provisional(&mut self) -> RequestUid {
        let uid = RequestUid::Provisional(self.next_provisional);
        self.next_provisional = self.next_provisional.wrapping_add(1);
        uid
    }

    /// Next permanent output id.
    pub fn next_final(&mut self) -> RequestUid {
        let uid = RequestUid::Final(self.next_final);
        self.next_final += 1;
        uid
    }

    /// Stamps a request with its permanent id just before it is emitted.
    pub fn assign_final(&mut self, request: &mut TriggerRequest) {
        request.uid = self.next_final();
    }

    /// The id the next emitted request will get.
    #[must_use]
    pub const fn peek_final(&self) -> u64 {
        self.next_final
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}
