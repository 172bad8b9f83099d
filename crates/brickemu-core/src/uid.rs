//! Base-58 device UIDs.
//!
//! Every Brick and Bricklet is addressed by a short base-58 string such as
//! `"EALV3"`. On the wire the same UID travels as a little-endian `u32`, so a
//! UID whose decoded value does not fit into 32 bits is rejected.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Base-58 alphabet used by Tinkerforge UIDs.
pub const BASE58_ALPHABET: &[u8; 58] =
    b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

/// The broadcast UID number addressing every device.
pub const BROADCAST_UID_NUMBER: u32 = 0;

/// Errors produced while parsing a UID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UidError {
    /// The UID string is empty.
    #[error("UID is empty")]
    Empty,

    /// The UID contains a character outside the base-58 alphabet.
    #[error("UID \"{uid}\" contains invalid character {character:?} at index {index}")]
    InvalidCharacter {
        /// The offending UID string.
        uid: String,
        /// The character that is not part of the alphabet.
        character: char,
        /// Byte index of the character.
        index: usize,
    },

    /// The decoded UID does not fit into 32 bits.
    #[error("UID \"{uid}\" is too big")]
    TooBig {
        /// The offending UID string.
        uid: String,
    },
}

/// A device UID in both its human (base-58) and wire (`u32`) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid {
    text: String,
    number: u32,
}

impl Uid {
    /// Parses a base-58 UID string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty, contains characters outside
    /// the alphabet, or decodes to a value larger than `u32::MAX`.
    pub fn parse(text: &str) -> Result<Self, UidError> {
        let number = base58_to_number(text)?;
        Ok(Self {
            text: text.to_string(),
            number,
        })
    }

    /// Builds a UID from its wire number.
    #[must_use]
    pub fn from_number(number: u32) -> Self {
        Self {
            text: number_to_base58(number),
            number,
        }
    }

    /// Returns the base-58 representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the wire number.
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }

    /// Returns `true` for the broadcast UID.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        self.number == BROADCAST_UID_NUMBER
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Uid {
    type Err = UidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Decodes a base-58 string into its 32-bit wire number.
///
/// # Errors
///
/// See [`Uid::parse`].
pub fn base58_to_number(text: &str) -> Result<u32, UidError> {
    if text.is_empty() {
        return Err(UidError::Empty);
    }

    let mut number: u64 = 0;
    for (index, character) in text.char_indices() {
        let digit = BASE58_ALPHABET
            .iter()
            .position(|&c| char::from(c) == character)
            .ok_or_else(|| UidError::InvalidCharacter {
                uid: text.to_string(),
                character,
                index,
            })?;

        number = number
            .checked_mul(58)
            .and_then(|n| n.checked_add(digit as u64))
            .filter(|n| *n <= u64::from(u32::MAX))
            .ok_or_else(|| UidError::TooBig {
                uid: text.to_string(),
            })?;
    }

    u32::try_from(number).map_err(|_| UidError::TooBig {
        uid: text.to_string(),
    })
}

/// Encodes a wire number as a base-58 string.
#[must_use]
pub fn number_to_base58(mut number: u32) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(BASE58_ALPHABET[(number % 58) as usize]);
        number /= 58;
        if number == 0 {
            break;
        }
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}
