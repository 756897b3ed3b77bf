//! Octal file modes in configuration files
//!
//! Modes are written the way `chmod` takes them: `"644"`, `"0o600"` or a bare
//! `600` (read as octal digits, not decimal).

use serde::{Deserialize, Deserializer, Serializer};

/// Parse an octal permission string
pub fn parse_octal(raw: &str) -> Result<u32, String> {
    let digits = raw.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    if digits.is_empty() {
        return Err("empty mode".to_string());
    }
    u32::from_str_radix(digits, 8).map_err(|e| format!("not an octal mode: {e}"))
}

/// Write a mode as octal digits
pub fn serialize<S>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{mode:o}"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModeRepr {
    Text(String),
    Number(u32),
}

/// Read a mode from an octal string or number
pub fn deserialize<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match ModeRepr::deserialize(deserializer)? {
        ModeRepr::Text(s) => s,
        ModeRepr::Number(n) => n.to_string(),
    };
    parse_octal(&raw).map_err(serde::de::Error::custom)
}
