//! Fixed-size raw sample frame shared between the sampling peripheral and
//! the control cadence.

use thermal_traits::slots;

use crate::MAX_HOTENDS;

/// Total channel slots in a frame.
pub const CHANNELS: usize = slots::COUNT;

const _: () = assert!(slots::HOTENDS == MAX_HOTENDS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Hotend(usize),
    Bed,
    Ambient,
    Pinda,
}

impl Channel {
    pub const fn slot(self) -> usize {
        match self {
            Self::Hotend(i) => i,
            Self::Bed => slots::BED,
            Self::Ambient => slots::AMBIENT,
            Self::Pinda => slots::PINDA,
        }
    }
}

/// One oversampled reading per channel slot. Unused slots stay 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrame {
    raw: [u16; CHANNELS],
}

impl RawFrame {
    pub fn from_slice(raw: &[u16]) -> Self {
        let mut frame = Self::default();
        let n = raw.len().min(CHANNELS);
        frame.raw[..n].copy_from_slice(&raw[..n]);
        frame
    }

    pub fn get(&self, ch: Channel) -> u16 {
        self.raw.get(ch.slot()).copied().unwrap_or(0)
    }

    pub fn set(&mut self, ch: Channel, value: u16) {
        if let Some(slot) = self.raw.get_mut(ch.slot()) {
            *slot = value;
        }
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.raw
    }
}
