//! Bencode has no boolean type; BEP-5's `implied_port` is conventionally
//! wire-encoded as the integer `0` or `1`.
use serde::{Deserialize, Deserializer};

pub fn is_false(value: &bool) -> bool {
    !value
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u8::deserialize(deserializer)?;
    Ok(value != 0)
}
