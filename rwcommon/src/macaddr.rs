// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Link-layer MAC addresses with optional mask support.
//!
//! Masked addresses (`aa:bb:cc:00:00:00/24`) compare equal to any address
//! sharing the unmasked prefix; they are used by the device and packet
//! filters to match OUI ranges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MacParseError {
    #[error("invalid MAC address: {0}")]
    Invalid(String),
    #[error("invalid MAC mask: {0}")]
    InvalidMask(String),
}

/// A 48-bit MAC address plus a prefix mask in bits (48 = exact match).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr {
    addr: u64,
    mask_bits: u8,
}

impl Default for MacAddr {
    fn default() -> Self {
        MacAddr::ZERO
    }
}

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr {
        addr: 0,
        mask_bits: 48,
    };

    pub fn new(octets: [u8; 6]) -> Self {
        let mut addr = 0u64;
        for o in octets {
            addr = (addr << 8) | o as u64;
        }
        MacAddr {
            addr,
            mask_bits: 48,
        }
    }

    pub fn with_mask(octets: [u8; 6], mask_bits: u8) -> Self {
        let mut m = MacAddr::new(octets);
        m.mask_bits = mask_bits.min(48);
        m
    }

    pub fn octets(&self) -> [u8; 6] {
        let mut o = [0u8; 6];
        for (i, b) in o.iter_mut().enumerate() {
            *b = (self.addr >> (40 - i * 8)) as u8;
        }
        o
    }

    /// The address as a 64-bit integer, used for device key derivation.
    pub fn as_u64(&self) -> u64 {
        self.addr
    }

    pub fn from_u64(v: u64) -> Self {
        MacAddr {
            addr: v & 0xFFFF_FFFF_FFFF,
            mask_bits: 48,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.addr == 0
    }

    fn mask(&self) -> u64 {
        if self.mask_bits >= 48 {
            0xFFFF_FFFF_FFFF
        } else {
            !(0xFFFF_FFFF_FFFFu64 >> self.mask_bits) & 0xFFFF_FFFF_FFFF
        }
    }

    /// True if `other` falls inside this address' masked range.  An exact
    /// address matches only itself.
    pub fn matches(&self, other: &MacAddr) -> bool {
        let m = self.mask();
        (self.addr & m) == (other.addr & m)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )?;
        if self.mask_bits < 48 {
            write!(f, "/{}", self.mask_bits)?;
        }
        Ok(())
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, mask_part) = match s.split_once('/') {
            Some((a, m)) => (a, Some(m)),
            None => (s, None),
        };

        let mut octets = [0u8; 6];
        let mut n = 0;
        for part in addr_part.split(':') {
            if n >= 6 || part.len() != 2 {
                return Err(MacParseError::Invalid(s.to_string()));
            }
            octets[n] = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::Invalid(s.to_string()))?;
            n += 1;
        }
        if n != 6 {
            return Err(MacParseError::Invalid(s.to_string()));
        }

        let mask_bits = match mask_part {
            Some(m) => {
                let bits: u8 = m
                    .parse()
                    .map_err(|_| MacParseError::InvalidMask(s.to_string()))?;
                if bits > 48 {
                    return Err(MacParseError::InvalidMask(s.to_string()));
                }
                bits
            }
            None => 48,
        };

        Ok(MacAddr::with_mask(octets, mask_bits))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(m: MacAddr) -> String {
        m.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let m: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(m.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(m.to_string().parse::<MacAddr>().unwrap(), m);
        assert_eq!(m.as_u64(), 0xAABBCCDDEEFF);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:gg".parse::<MacAddr>().is_err());
        assert!("aabbccddeeff".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff/49".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_masked_match() {
        let oui: MacAddr = "aa:bb:cc:00:00:00/24".parse().unwrap();
        let inside: MacAddr = "aa:bb:cc:12:34:56".parse().unwrap();
        let outside: MacAddr = "aa:bb:cd:12:34:56".parse().unwrap();

        assert!(oui.matches(&inside));
        assert!(!oui.matches(&outside));

        let exact: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert!(exact.matches(&exact));
        assert!(!exact.matches(&inside));
    }

    #[test]
    fn test_u64_roundtrip() {
        let m: MacAddr = "01:02:03:04:05:06".parse().unwrap();
        assert_eq!(MacAddr::from_u64(m.as_u64()), m);
    }
}
