//! Owner identity and address helpers.
//!
//! Profiles are keyed by the raw `From` header; everything that needs a bare
//! address (transport recipients, stats display) goes through
//! [`normalize_address`]. Display names are inferred from the address local
//! part, never fetched.

use serde::{Deserialize, Serialize};

/// The identity replies are written as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub display_name: String,
    pub address: String,
    pub role: String,
}

impl UserIdentity {
    /// Builds an identity from a mailbox address, inferring the display name
    /// from the local part.
    pub fn from_address(address: &str, role: impl Into<String>) -> Self {
        Self {
            display_name: display_name_for(address),
            address: address.trim().to_string(),
            role: role.into(),
        }
    }
}

/// Extracts the bare address from a header value like `"Jane <jane@x.com>"`.
/// Values without angle brackets are returned trimmed.
pub fn normalize_address(raw: &str) -> String {
    if let Some(start) = raw.find('<')
        && let Some(len) = raw[start + 1..].find('>')
    {
        return raw[start + 1..start + 1 + len].trim().to_string();
    }
    raw.trim().to_string()
}

/// Infers a display name from an address local part: `first.last@x` becomes
/// `"First Last"`, a plain local part is capitalized, and an empty address
/// falls back to `"Assistant"`.
pub fn display_name_for(address: &str) -> String {
    let local = address.trim().split('@').next().unwrap_or("").trim();
    if local.is_empty() {
        return "Assistant".to_string();
    }
    if local.contains('.') {
        return local
            .split('.')
            .filter(|part| !part.is_empty())
            .map(capitalize)
            .collect::<Vec<_>>()
            .join(" ");
    }
    capitalize(local)
}

/// Uppercases the first character and lowercases the rest.
fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

/// Capitalizes each whitespace-separated word.
pub fn title_case(text: &str) -> String {
    text.split_whitespace().map(capitalize).collect::<Vec<_>>().join(" ")
}
