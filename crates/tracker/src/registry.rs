//! Per-rank connection bookkeeping.
//!
//! The registry is owned by the server's event loop, the single writer for
//! the whole session. All mutation goes through `&mut self`, so two
//! handshakes racing for one rank are linearized by the loop and exactly one
//! of them wins.

use crate::bridge::protocol::Rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotState {
    Pending,
    Connected,
    /// Topology delivered and acknowledged.
    Ready,
}

/// One rank's slot. Created at session start and never recreated.
#[derive(Debug)]
pub struct WorkerSlot<H> {
    rank: Rank,
    addr: Option<String>,
    handle: Option<H>,
    state: SlotState,
}

impl<H> WorkerSlot<H> {
    fn pending(rank: Rank) -> Self {
        Self {
            rank,
            addr: None,
            handle: None,
            state: SlotState::Pending,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Address the worker advertised during its handshake.
    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry already initialized")]
    AlreadyInitialized,
    #[error("registry not initialized")]
    Uninitialized,
    #[error("rank {0} is already taken")]
    DuplicateRank(Rank),
    #[error("rank {rank} is outside the group of {world_size}")]
    UnknownRank { rank: Rank, world_size: usize },
    #[error("rank {0} is not connected")]
    NotConnected(Rank),
}

#[derive(Debug)]
pub struct ConnectionRegistry<H> {
    slots: Option<Vec<WorkerSlot<H>>>,
}

impl<H> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self { slots: None }
    }

    /// Create `n` Pending slots. Only valid once per session.
    pub fn register_pending(&mut self, n: usize) -> Result<(), RegistryError> {
        if self.slots.is_some() {
            return Err(RegistryError::AlreadyInitialized);
        }
        self.slots = Some((0..n).map(|i| WorkerSlot::pending(Rank::from_index(i))).collect());
        Ok(())
    }

    pub fn world_size(&self) -> usize {
        self.slots.as_ref().map_or(0, Vec::len)
    }

    pub fn slot(&self, rank: Rank) -> Option<&WorkerSlot<H>> {
        self.slots.as_ref()?.get(rank.index())
    }

    fn slot_mut(&mut self, rank: Rank) -> Result<&mut WorkerSlot<H>, RegistryError> {
        let slots = self.slots.as_mut().ok_or(RegistryError::Uninitialized)?;
        let world_size = slots.len();
        slots
            .get_mut(rank.index())
            .ok_or(RegistryError::UnknownRank { rank, world_size })
    }

    /// Whether `rank` could be connected right now, without taking a handle.
    pub fn check_pending(&self, rank: Rank) -> Result<(), RegistryError> {
        let slots = self.slots.as_ref().ok_or(RegistryError::Uninitialized)?;
        match slots.get(rank.index()) {
            None => Err(RegistryError::UnknownRank {
                rank,
                world_size: slots.len(),
            }),
            Some(slot) if slot.state != SlotState::Pending => {
                Err(RegistryError::DuplicateRank(rank))
            }
            Some(_) => Ok(()),
        }
    }

    /// Pending → Connected, taking ownership of the connection handle.
    ///
    /// On error the handle is dropped and the slot is left untouched.
    pub fn mark_connected(
        &mut self,
        rank: Rank,
        addr: impl Into<String>,
        handle: H,
    ) -> Result<(), RegistryError> {
        self.reserve(rank, addr)?;
        self.attach(rank, handle)
    }

    /// Pending → Connected without a handle yet; `attach` supplies it later.
    pub fn reserve(&mut self, rank: Rank, addr: impl Into<String>) -> Result<(), RegistryError> {
        self.check_pending(rank)?;
        let slot = self.slot_mut(rank)?;
        slot.addr = Some(addr.into());
        slot.state = SlotState::Connected;
        Ok(())
    }

    /// Store the handle of a Connected slot.
    pub fn attach(&mut self, rank: Rank, handle: H) -> Result<(), RegistryError> {
        let slot = self.slot_mut(rank)?;
        if slot.state != SlotState::Connected {
            return Err(RegistryError::NotConnected(rank));
        }
        slot.handle = Some(handle);
        Ok(())
    }

    /// Connected → Pending, handing back whatever handle was held.
    ///
    /// The rank becomes claimable again.
    pub fn mark_lost(&mut self, rank: Rank) -> Result<Option<H>, RegistryError> {
        let slot = self.slot_mut(rank)?;
        if slot.state != SlotState::Connected {
            return Err(RegistryError::NotConnected(rank));
        }
        slot.addr = None;
        slot.state = SlotState::Pending;
        Ok(slot.handle.take())
    }

    /// Handles of Connected slots, for watching them while the group fills.
    pub fn connected_handles_mut(&mut self) -> impl Iterator<Item = (Rank, &mut H)> {
        self.slots
            .iter_mut()
            .flatten()
            .filter(|s| s.state == SlotState::Connected)
            .filter_map(|s| {
                let rank = s.rank;
                s.handle.as_mut().map(|h| (rank, h))
            })
    }

    /// Connected → Ready.
    pub fn mark_ready(&mut self, rank: Rank) -> Result<(), RegistryError> {
        let slot = self.slot_mut(rank)?;
        if slot.state != SlotState::Connected {
            return Err(RegistryError::NotConnected(rank));
        }
        slot.state = SlotState::Ready;
        Ok(())
    }

    /// Lowest rank still Pending.
    pub fn next_free_rank(&self) -> Option<Rank> {
        self.slots
            .as_ref()?
            .iter()
            .find(|s| s.state == SlotState::Pending)
            .map(|s| s.rank)
    }

    pub fn connected_count(&self) -> usize {
        self.slots.as_ref().map_or(0, |slots| {
            slots
                .iter()
                .filter(|s| s.state >= SlotState::Connected)
                .count()
        })
    }

    /// True iff initialized and every slot is at least Connected.
    pub fn all_connected(&self) -> bool {
        self.slots.as_ref().is_some_and(|slots| {
            slots.iter().all(|s| s.state >= SlotState::Connected)
        })
    }

    pub fn all_ready(&self) -> bool {
        self.slots
            .as_ref()
            .is_some_and(|slots| slots.iter().all(|s| s.state == SlotState::Ready))
    }

    /// Address advertised by `rank`, if it has connected.
    pub fn addr(&self, rank: Rank) -> Option<&str> {
        self.slot(rank)?.addr()
    }

    /// Hand every stored handle to the caller, in rank order.
    ///
    /// Slot states are left as they are: the caller becomes the owner of the
    /// connections while the registry keeps tracking progress.
    pub fn take_handles(&mut self) -> Vec<(Rank, H)> {
        self.slots
            .iter_mut()
            .flatten()
            .filter_map(|s| s.handle.take().map(|h| (s.rank, h)))
            .collect()
    }
}
