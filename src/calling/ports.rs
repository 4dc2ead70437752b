//! Process-wide RTP port reservation.
//!
//! One `PortReservation` is shared (behind an `Arc`) by every call so that no
//! two media streams bind the same local port. Only even ports are handed out;
//! the odd port above each one is implicitly kept for RTCP.

use std::collections::HashSet;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default audio RTP range.
pub const AUDIO_PORT_RANGE: PortRange = PortRange {
    start: 16384,
    end: 32766,
};

/// Default video RTP range.
pub const VIDEO_PORT_RANGE: PortRange = PortRange {
    start: 49152,
    end: 65534,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("invalid port range {0}-{1}")]
    InvalidRange(u16, u16),

    #[error("no free port in range {0}-{1}")]
    Exhausted(u16, u16),

    #[error("random source unavailable")]
    Random,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// `None` when the range starts at the last port and it is odd.
    fn first_even(&self) -> Option<u16> {
        self.start.checked_add(self.start % 2)
    }

    /// Number of even ports usable for RTP (RTCP needs port + 1 in range).
    fn even_slots(&self) -> u16 {
        let Some(first) = self.first_even() else {
            return 0;
        };
        if self.end <= first {
            return 0;
        }
        ((u32::from(self.end - first) + 1) / 2) as u16
    }
}

#[derive(Debug, Default)]
pub struct PortReservation {
    in_use: DashSet<u16>,
}

impl PortReservation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a random free even port in `range`.
    pub fn acquire(&self, range: PortRange) -> Result<u16, PortError> {
        let slots = range.even_slots();
        let first = match range.first_even() {
            Some(first) if range.start != 0 && slots != 0 => first,
            _ => return Err(PortError::InvalidRange(range.start, range.end)),
        };

        let mut seed = [0u8; 2];
        getrandom::getrandom(&mut seed).map_err(|_| PortError::Random)?;
        let offset = u16::from_le_bytes(seed) % slots;

        // Walk every slot once starting at a random offset
        for i in 0..slots {
            let port = first + 2 * ((offset + i) % slots);
            if self.in_use.insert(port) {
                tracing::trace!("Reserved port {}", port);
                return Ok(port);
            }
        }
        Err(PortError::Exhausted(range.start, range.end))
    }

    /// Returns `false` if the port was not reserved.
    pub fn release(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        let released = self.in_use.remove(&port).is_some();
        if !released {
            tracing::warn!("Releasing port {} that was not reserved", port);
        }
        released
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.in_use.contains(&port)
    }

    pub fn reserved(&self) -> HashSet<u16> {
        self.in_use.iter().map(|p| *p).collect()
    }

    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}
