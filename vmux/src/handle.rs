//! Handle table: the per-dispatcher map of live conversations.
//!
//! Owned by one [`Muxer`](crate::Muxer) and mutated only from its event
//! loop, which is the single serialization domain for all conversation
//! state. Not a global: tests run several tables side by side.

#![cfg(unix)]

use std::collections::HashMap;

use vmux_proto::CONTROL_HANDLE;

use crate::error::{Error, Result};
use crate::stream::Stream;

/// Which side of the transport this dispatcher is.
///
/// The two sides allocate from disjoint handle spaces (initiator odd,
/// acceptor even) so simultaneous opens can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Role {
    /// The side that connected; allocates odd handles.
    Initiator,
    /// The side that accepted; allocates even handles.
    Acceptor,
}

/// Lifecycle of one conversation. `Closed` is terminal and means removal
/// from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConvState {
    /// We sent `Open` (or `FdTransfer`) and have seen no traffic from the
    /// peer for this handle yet.
    Opening,
    /// Data may flow in either direction.
    Established,
    /// We sent `Close` and dropped the endpoint; the handle stays reserved
    /// until the peer's `Close` retires it.
    Closing,
}

/// One live conversation: its endpoint and lifecycle state.
pub struct Entry {
    /// The owned local endpoint; `None` once the descriptor is closed
    /// (`Closing` entries awaiting the peer's acknowledgment).
    pub stream: Option<Box<dyn Stream>>,
    /// Current lifecycle state.
    pub state: ConvState,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("stream", &self.stream.as_ref().map(|_| "..."))
            .field("state", &self.state)
            .finish()
    }
}

/// Process-local mapping from handle to live conversation.
///
/// Invariant: a handle present in the table names exactly one stream, and
/// handle [`CONTROL_HANDLE`] is never present.
#[derive(Debug)]
pub struct HandleTable {
    /// Live conversations.
    entries: HashMap<u32, Entry>,
    /// Next allocation candidate; stepped by 2 to stay in this side's
    /// parity class, wrapping instead of overflowing.
    next: u32,
}

impl HandleTable {
    /// Creates an empty table allocating from `role`'s handle space.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            entries: HashMap::new(),
            next: match role {
                Role::Initiator => 1,
                Role::Acceptor => 2,
            },
        }
    }

    /// Picks the next free handle, builds the stream bound to it via `make`,
    /// and inserts the entry in the `Opening` state.
    ///
    /// The constructor receives the handle because local endpoints stamp it
    /// on every `Data` message they produce; if it fails the table is left
    /// untouched.
    pub fn allocate(
        &mut self,
        make: impl FnOnce(u32) -> Result<Box<dyn Stream>>,
    ) -> Result<u32> {
        // Live handles are skipped; a handle is reusable only once fully
        // retired (removed from the map).
        let mut handle = self.next;
        while self.entries.contains_key(&handle) {
            handle = Self::step(handle);
        }
        let stream = make(handle)?;
        self.next = Self::step(handle);
        self.entries.insert(
            handle,
            Entry {
                stream: Some(stream),
                state: ConvState::Opening,
            },
        );
        Ok(handle)
    }

    /// Binds a peer-chosen handle (inbound `Open`/`FdTransfer`) directly in
    /// the `Established` state.
    pub fn bind(&mut self, handle: u32, stream: Box<dyn Stream>) -> Result<()> {
        if handle == CONTROL_HANDLE || self.entries.contains_key(&handle) {
            return Err(Error::Handle { handle });
        }
        self.entries.insert(
            handle,
            Entry {
                stream: Some(stream),
                state: ConvState::Established,
            },
        );
        Ok(())
    }

    /// Looks up a live conversation without taking a mutable borrow.
    pub fn get(&self, handle: u32) -> Option<&Entry> {
        self.entries.get(&handle)
    }

    /// Looks up a live conversation.
    pub fn get_mut(&mut self, handle: u32) -> Option<&mut Entry> {
        self.entries.get_mut(&handle)
    }

    /// Removes an entry, closing its descriptor if still open. Returns
    /// whether the handle was live.
    pub fn release(&mut self, handle: u32) -> bool {
        self.entries.remove(&handle).is_some()
    }

    /// Handles of all current entries.
    pub fn handles(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, closing all owned descriptors.
    pub fn drain(&mut self) {
        self.entries.clear();
    }

    /// Advances within the parity class, wrapping around and never landing
    /// on [`CONTROL_HANDLE`].
    const fn step(handle: u32) -> u32 {
        match handle.checked_add(2) {
            Some(next) => next,
            // Wrap back to the start of this parity class (1 or 2).
            None => {
                if handle % 2 == 1 {
                    1
                } else {
                    2
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PipeStream;

    fn dummy_stream(handle: u32) -> Result<Box<dyn Stream>> {
        let (r, _w) = nix::unistd::pipe().unwrap();
        Ok(Box::new(PipeStream::reader(r, handle).unwrap()))
    }

    #[test]
    fn allocation_is_monotonic_within_parity() {
        let mut table = HandleTable::new(Role::Initiator);
        assert_eq!(table.allocate(dummy_stream).unwrap(), 1);
        assert_eq!(table.allocate(dummy_stream).unwrap(), 3);
        assert_eq!(table.allocate(dummy_stream).unwrap(), 5);

        let mut acceptor = HandleTable::new(Role::Acceptor);
        assert_eq!(acceptor.allocate(dummy_stream).unwrap(), 2);
        assert_eq!(acceptor.allocate(dummy_stream).unwrap(), 4);
    }

    #[test]
    fn released_handles_are_not_immediately_reused() {
        let mut table = HandleTable::new(Role::Initiator);
        let first = table.allocate(dummy_stream).unwrap();
        assert!(table.release(first));
        // Allocation keeps moving forward; the retired handle comes back
        // only after wraparound.
        assert_ne!(table.allocate(dummy_stream).unwrap(), first);
    }

    #[test]
    fn release_is_idempotent() {
        let mut table = HandleTable::new(Role::Initiator);
        let handle = table.allocate(dummy_stream).unwrap();
        assert!(table.release(handle));
        assert!(!table.release(handle));
        assert!(table.get_mut(handle).is_none());
    }

    #[test]
    fn bind_rejects_occupied_and_control_handles() {
        let mut table = HandleTable::new(Role::Acceptor);
        table.bind(7, dummy_stream(7).unwrap()).unwrap();
        assert!(matches!(
            table.bind(7, dummy_stream(7).unwrap()),
            Err(Error::Handle { handle: 7 })
        ));
        assert!(matches!(
            table.bind(CONTROL_HANDLE, dummy_stream(0).unwrap()),
            Err(Error::Handle { .. })
        ));
    }

    #[test]
    fn bound_entries_start_established() {
        let mut table = HandleTable::new(Role::Acceptor);
        table.bind(9, dummy_stream(9).unwrap()).unwrap();
        assert_eq!(table.get_mut(9).unwrap().state, ConvState::Established);

        let allocated = table.allocate(dummy_stream).unwrap();
        assert_eq!(
            table.get_mut(allocated).unwrap().state,
            ConvState::Opening
        );
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = HandleTable::new(Role::Initiator);
        table.allocate(dummy_stream).unwrap();
        table.allocate(dummy_stream).unwrap();
        assert_eq!(table.len(), 2);
        table.drain();
        assert!(table.is_empty());
    }
}
