//! # capx-id
//!
//! Typed identifiers for the cloud resources the machine actuator manages.
//!
//! ## ID Format
//!
//! Provider IDs use a prefixed hex format: `{prefix}-{hex}`
//!
//! Examples:
//! - `i-0a1b2c3d4e5f60718`
//! - `sg-1f2e3d4c`
//!
//! The hex part is either 8 (legacy) or 17 lowercase hex characters.
//! Typing the IDs keeps an instance ID from being passed where a
//! security group is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Accepted lengths of the hex portion.
const HEX_LENGTHS: [usize; 2] = [8, 17];

/// Validates the hex portion of a provider ID.
pub fn validate_hex(hex: &str) -> Result<(), IdError> {
    if !HEX_LENGTHS.contains(&hex.len()) {
        return Err(IdError::InvalidLength { actual: hex.len() });
    }
    if !hex
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(IdError::InvalidHex(hex.to_string()));
    }
    Ok(())
}

/// Generates a fresh 17-character hex suffix.
pub fn random_hex() -> String {
    use rand::Rng;

    let mut rng = rand::rng();
    (0..17)
        .map(|_| {
            let n: u8 = rng.random_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect()
}
