// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stable 128-bit device identifiers.
//!
//! A device key pins a device record to `(server, phy, mac)`: the top word
//! packs soft checksums of the server uuid and phy name, the bottom word is
//! the MAC itself.  The same inputs produce the same key across restarts,
//! which is what lets a reopened log attach new sightings to old devices.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::macaddr::MacAddr;

const ADLER_MOD: u32 = 65521;

/// Adler-32 over a byte slice.  Used only for key derivation; not a crypto
/// checksum.
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }

    (b << 16) | a
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid device key: {0}")]
pub struct DeviceKeyParseError(String);

/// 128-bit device key: `spkey` = (adler32(server uuid string) << 32) |
/// adler32(phy name), `dkey` = MAC as a 64-bit integer.
///
/// String form is two 16-digit uppercase big-endian hex words joined by `_`;
/// parsing accepts nothing else.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceKey {
    pub spkey: u64,
    pub dkey: u64,
}

impl DeviceKey {
    pub fn new(server_uuid: &Uuid, phy_name: &str, mac: &MacAddr) -> Self {
        let server_part = adler32(server_uuid.to_string().as_bytes()) as u64;
        let phy_part = adler32(phy_name.as_bytes()) as u64;

        DeviceKey {
            spkey: (server_part << 32) | phy_part,
            dkey: mac.as_u64(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.spkey == 0 && self.dkey == 0
    }

    pub fn device_mac(&self) -> MacAddr {
        MacAddr::from_u64(self.dkey)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}_{:016X}", self.spkey, self.dkey)
    }
}

impl FromStr for DeviceKey {
    type Err = DeviceKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sp, d) = s
            .split_once('_')
            .ok_or_else(|| DeviceKeyParseError(s.to_string()))?;

        if sp.len() != 16 || d.len() != 16 {
            return Err(DeviceKeyParseError(s.to_string()));
        }

        // Only the canonical uppercase form round-trips.
        if sp.chars().chain(d.chars()).any(|c| c.is_ascii_lowercase()) {
            return Err(DeviceKeyParseError(s.to_string()));
        }

        let spkey =
            u64::from_str_radix(sp, 16).map_err(|_| DeviceKeyParseError(s.to_string()))?;
        let dkey = u64::from_str_radix(d, 16).map_err(|_| DeviceKeyParseError(s.to_string()))?;

        Ok(DeviceKey { spkey, dkey })
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = DeviceKeyParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceKey> for String {
    fn from(k: DeviceKey) -> String {
        k.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32_vectors() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
    }

    #[test]
    fn test_key_stable_across_construction() {
        let uuid: Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();

        let k1 = DeviceKey::new(&uuid, "IEEE802.11", &mac);
        let k2 = DeviceKey::new(&uuid, "IEEE802.11", &mac);
        assert_eq!(k1, k2);
        assert_eq!(k1.dkey, 0xAABBCCDDEEFF);

        let other_phy = DeviceKey::new(&uuid, "Bluetooth", &mac);
        assert_ne!(k1, other_phy);
    }

    #[test]
    fn test_format_parse_roundtrip() {
        let uuid: Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let key = DeviceKey::new(&uuid, "IEEE802.11", &mac);

        let s = key.to_string();
        assert_eq!(s.len(), 33);
        let parsed: DeviceKey = s.parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.device_mac(), mac);
    }

    #[test]
    fn test_parse_strictness() {
        assert!("".parse::<DeviceKey>().is_err());
        assert!("0011".parse::<DeviceKey>().is_err());
        // no separator
        assert!("00000000000000000000000000000000".parse::<DeviceKey>().is_err());
        // short halves
        assert!("0000000000000000_0000".parse::<DeviceKey>().is_err());
        // lowercase hex is not canonical
        assert!("00000000000000ab_0000AABBCCDDEEFF".parse::<DeviceKey>().is_err());
        // junk characters
        assert!("000000000000000G_0000AABBCCDDEEFF".parse::<DeviceKey>().is_err());
    }
}
