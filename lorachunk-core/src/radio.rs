//! Radio identity: node address and channel, and the routing header they produce.

use serde::Deserialize;

use crate::protocol::{Route, BROADCAST_ADDR};

/// Lower band: offsets count from 410 MHz.
pub const LOW_BAND: std::ops::RangeInclusive<u16> = 410..=493;
/// Upper band: offsets count from 850 MHz.
pub const HIGH_BAND: std::ops::RangeInclusive<u16> = 850..=930;

/// Module settings as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RadioConfig {
    /// This node's address. 0xFFFF is reserved for broadcast.
    #[serde(default)]
    pub address: u16,
    /// Operating frequency in MHz.
    #[serde(default = "default_freq_mhz")]
    pub freq_mhz: u16,
}

fn default_freq_mhz() -> u16 {
    433
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            address: 0,
            freq_mhz: default_freq_mhz(),
        }
    }
}

impl RadioConfig {
    /// Validate and derive the on-air station identity.
    pub fn station(&self) -> Result<Station, RadioError> {
        if self.address == BROADCAST_ADDR {
            return Err(RadioError::BroadcastAddress);
        }
        let base = if HIGH_BAND.contains(&self.freq_mhz) {
            *HIGH_BAND.start()
        } else if LOW_BAND.contains(&self.freq_mhz) {
            *LOW_BAND.start()
        } else {
            return Err(RadioError::Frequency(self.freq_mhz));
        };
        // both bands span fewer than 256 MHz
        let freq_offset = (self.freq_mhz - base) as u8;
        Ok(Station {
            address: self.address,
            freq_offset,
        })
    }
}

/// A validated node identity: what goes in the source half of every route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Station {
    pub address: u16,
    pub freq_offset: u8,
}

impl Station {
    /// Route for a frame from this node to `dest`. The peer is assumed to sit
    /// on the same channel.
    pub fn route_to(&self, dest: u16) -> Route {
        Route {
            dest_addr: dest,
            dest_freq_offset: self.freq_offset,
            src_addr: self.address,
            src_freq_offset: self.freq_offset,
        }
    }

    /// Whether a frame addressed to `dest_addr` is for this node.
    pub fn accepts(&self, dest_addr: u16) -> bool {
        dest_addr == self.address || dest_addr == BROADCAST_ADDR
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("frequency {0} MHz outside 410-493 and 850-930")]
    Frequency(u16),
    #[error("address 0xFFFF is the broadcast address")]
    BroadcastAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(address: u16, freq_mhz: u16) -> Result<Station, RadioError> {
        RadioConfig { address, freq_mhz }.station()
    }

    #[test]
    fn offsets_per_band() {
        assert_eq!(station(1, 433).unwrap().freq_offset, 23);
        assert_eq!(station(1, 410).unwrap().freq_offset, 0);
        assert_eq!(station(1, 493).unwrap().freq_offset, 83);
        assert_eq!(station(1, 850).unwrap().freq_offset, 0);
        assert_eq!(station(1, 868).unwrap().freq_offset, 18);
        assert_eq!(station(1, 930).unwrap().freq_offset, 80);
    }

    #[test]
    fn rejects_out_of_band() {
        assert_eq!(station(1, 409), Err(RadioError::Frequency(409)));
        assert_eq!(station(1, 600), Err(RadioError::Frequency(600)));
        assert_eq!(station(1, 931), Err(RadioError::Frequency(931)));
    }

    #[test]
    fn rejects_broadcast_as_own_address() {
        assert_eq!(station(0xFFFF, 433), Err(RadioError::BroadcastAddress));
    }

    #[test]
    fn default_is_433_address_zero() {
        let s = RadioConfig::default().station().unwrap();
        assert_eq!(s, Station { address: 0, freq_offset: 23 });
    }

    #[test]
    fn route_and_accept() {
        let s = station(7, 433).unwrap();
        let r = s.route_to(9);
        assert_eq!(r.src_addr, 7);
        assert_eq!(r.dest_addr, 9);
        assert_eq!(r.dest_freq_offset, 23);
        assert!(s.accepts(7));
        assert!(s.accepts(BROADCAST_ADDR));
        assert!(!s.accepts(9));
    }
}
