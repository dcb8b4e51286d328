//! Slot-based unit enumeration
//!
//! Finds every unit sharing the bus without knowing their addresses
//! beforehand, even when several physical units currently hold the same
//! address. The host broadcasts a slot count; each unit independently maps
//! itself into one slot (a deterministic, host-opaque choice) and answers
//! only when its slot is polled. Collisions and silent slots are expected,
//! recoverable outcomes, so slot selection is re-randomized and the search
//! run for several rounds.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{
    escape, BusClient, BusStream, ProtocolError, BROADCAST_ADDRESS, PARAM_SLOT,
};

/// Default number of self-selection slots
pub const DEFAULT_SLOTS: u8 = 30;

/// Default number of search rounds
pub const DEFAULT_ROUNDS: u32 = 5;

/// Default per-slot response wait
pub const DEFAULT_SLOT_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors from the discovery engine
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Slot count must be in 5..=255, got {0}")]
    InvalidSlotCount(u8),

    #[error("No free address left in 1..=254")]
    AddressesExhausted,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One unit sighted during a discovery round.
///
/// `next_slot` is not an address: it is the slot the unit has selected for
/// the following round, reported by the device itself. It doubles as a
/// disambiguation token when renaming a unit, because several physical
/// units may currently share one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscoveredUnit {
    /// Address the unit answered from
    pub address: u8,
    /// Slot the unit will answer in next round
    pub next_slot: u8,
}

/// A slot where more than one unit answered at once, garbling the frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    /// The polled slot index
    pub slot: u8,
    /// The garbled bytes captured off the wire
    pub raw: Vec<u8>,
}

/// Result of one discovery round
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundReport {
    /// Units that answered cleanly, at most one per slot
    pub units: Vec<DiscoveredUnit>,
    /// Slots where a garbled answer was captured
    pub collisions: Vec<Collision>,
}

/// Outcome of polling one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Exactly one unit answered cleanly
    Unit(DiscoveredUnit),
    /// Two or more units answered at once; the captured garbled bytes
    Collision(Vec<u8>),
    /// Nobody answered (the normal case for most slots)
    Silent,
}

/// A rename performed by address auto-assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub old_address: u8,
    pub new_address: u8,
}

/// Slot-polling discovery engine borrowing a bus client
pub struct Discovery<'a, S: BusStream> {
    client: &'a mut BusClient<S>,
    slots: u8,
    slot_timeout: Duration,
}

impl<'a, S: BusStream> Discovery<'a, S> {
    /// Create an engine dividing the search into `slots` slots.
    ///
    /// Slot counts of 4 or less leave too few buckets for self-selection
    /// to converge and are rejected before any I/O.
    pub fn new(client: &'a mut BusClient<S>, slots: u8) -> Result<Self, DiscoveryError> {
        if slots <= 4 {
            return Err(DiscoveryError::InvalidSlotCount(slots));
        }
        Ok(Self { client, slots, slot_timeout: DEFAULT_SLOT_TIMEOUT })
    }

    /// Override the per-slot response wait
    pub fn slot_timeout(mut self, timeout: Duration) -> Self {
        self.slot_timeout = timeout;
        self
    }

    /// Broadcast the slot count so every listening unit re-selects a slot
    pub fn announce(&mut self) -> Result<(), DiscoveryError> {
        debug!(slots = self.slots, "announcing slot count");
        self.client
            .write_no_reply(BROADCAST_ADDRESS, PARAM_SLOT, &[self.slots])?;
        Ok(())
    }

    /// Poll one slot; at most one unit is expected to answer
    pub fn poll_slot(&mut self, slot: u8) -> Result<SlotOutcome, DiscoveryError> {
        let response =
            self.client
                .read_with(BROADCAST_ADDRESS, PARAM_SLOT, &[slot], self.slot_timeout)?;

        if response.ok {
            if let (Some(address), [next_slot]) = (response.address, response.payload.as_slice()) {
                debug!(slot, address, next_slot, "unit answered");
                return Ok(SlotOutcome::Unit(DiscoveredUnit { address, next_slot: *next_slot }));
            }
            warn!(slot, "bad slot selection: {}", escape(&response.payload));
            return Ok(SlotOutcome::Silent);
        }
        if !response.raw.is_empty() {
            debug!(slot, "collision: {}", escape(&response.raw));
            return Ok(SlotOutcome::Collision(response.raw));
        }
        Ok(SlotOutcome::Silent)
    }

    /// Run one full round: announce, then poll every slot.
    ///
    /// A non-ok response with captured bytes means two or more units
    /// answered the same slot simultaneously; the slot is skipped for this
    /// round and the garbled bytes reported.
    pub fn round(&mut self) -> Result<RoundReport, DiscoveryError> {
        self.announce()?;
        let mut report = RoundReport::default();

        for slot in 0..=self.slots {
            match self.poll_slot(slot)? {
                SlotOutcome::Unit(unit) => report.units.push(unit),
                SlotOutcome::Collision(raw) => report.collisions.push(Collision { slot, raw }),
                // Silence is the normal outcome for most slots
                SlotOutcome::Silent => {}
            }
        }

        info!(
            units = report.units.len(),
            collisions = report.collisions.len(),
            "round complete"
        );
        Ok(report)
    }

    /// Run several rounds.
    ///
    /// Slot self-selection is probabilistic and a collision can hide a unit
    /// in one round but not another, so a unit counts as found when it is
    /// seen in at least one round.
    pub fn search(&mut self, rounds: u32) -> Result<Vec<RoundReport>, DiscoveryError> {
        let mut reports = Vec::with_capacity(rounds as usize);
        for round in 1..=rounds {
            info!(round, rounds, "starting search round");
            reports.push(self.round()?);
        }
        Ok(reports)
    }

    /// Rename units whose address is 0 or already claimed.
    ///
    /// Walks `units` (the sightings of a single round: a unit's `next_slot`
    /// token is only valid for the round that reported it) and renames each
    /// conflicting unit to the lowest unused address in 1..=254. `reserved`
    /// addresses are never assigned; address 0 is always reserved.
    ///
    /// Known race, inherited from the device protocol: if two units sharing
    /// an address also reported the same `next_slot` in this round, the
    /// rename is ambiguous and both may accept it.
    pub fn assign_addresses(
        &mut self,
        units: &[DiscoveredUnit],
        reserved: &[u8],
    ) -> Result<Vec<Assignment>, DiscoveryError> {
        let mut used: Vec<u8> = reserved.to_vec();
        used.push(0);

        let mut assignments = Vec::new();
        for unit in units {
            if !used.contains(&unit.address) {
                used.push(unit.address);
                continue;
            }
            let new_address = (1u8..=254)
                .find(|a| !used.contains(a))
                .ok_or(DiscoveryError::AddressesExhausted)?;
            info!(
                old = unit.address,
                new = new_address,
                next_slot = unit.next_slot,
                "reassigning unit address"
            );
            self.client.rename(unit.address, new_address, unit.next_slot)?;
            used.push(new_address);
            assignments.push(Assignment { old_address: unit.address, new_address });
        }
        Ok(assignments)
    }
}

/// Units found across all rounds, collapsed by address (latest sighting
/// wins) and sorted by address.
///
/// Physically distinct units sharing one address appear as a single entry
/// here; use [`Discovery::assign_addresses`] on one round's sightings to
/// split them apart.
pub fn found_units(rounds: &[RoundReport]) -> Vec<DiscoveredUnit> {
    let mut latest: Vec<DiscoveredUnit> = Vec::new();
    for unit in rounds.iter().flat_map(|r| &r.units) {
        match latest.iter_mut().find(|u| u.address == unit.address) {
            Some(existing) => *existing = *unit,
            None => latest.push(*unit),
        }
    }
    latest.sort_by_key(|u| u.address);
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn found_units_collapses_by_address() {
        let rounds = vec![
            RoundReport {
                units: vec![
                    DiscoveredUnit { address: 0x20, next_slot: 3 },
                    DiscoveredUnit { address: 0x10, next_slot: 7 },
                ],
                collisions: vec![],
            },
            RoundReport {
                units: vec![DiscoveredUnit { address: 0x10, next_slot: 12 }],
                collisions: vec![],
            },
        ];
        let units = found_units(&rounds);
        assert_eq!(
            units,
            vec![
                DiscoveredUnit { address: 0x10, next_slot: 12 },
                DiscoveredUnit { address: 0x20, next_slot: 3 },
            ]
        );
    }
}
