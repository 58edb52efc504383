//! Hardware address validation
//!
//! Addresses are accepted in the canonical radio format only: six pairs of
//! uppercase hex digits separated by colons (`00:11:22:AA:BB:CC`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a canonical address string
pub const ADDRESS_LEN: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Invalid MAC address provided.")]
    InvalidAddress,
}

/// A validated radio hardware address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parse and validate an address string
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if is_valid_address(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(AddressError::InvalidAddress)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Check an address against the canonical format without allocating
pub fn is_valid_address(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.len() != ADDRESS_LEN {
        return false;
    }

    bytes.iter().enumerate().all(|(i, b)| match i % 3 {
        2 => *b == b':',
        _ => matches!(b, b'0'..=b'9' | b'A'..=b'F'),
    })
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if is_valid_address(&value) {
            Ok(Self(value))
        } else {
            Err(AddressError::InvalidAddress)
        }
    }
}

impl From<DeviceAddress> for String {
    fn from(addr: DeviceAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
