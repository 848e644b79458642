//! Bind address sanitizing.

use serde_json::Value;

use crate::config::WILDCARD_ADDRESS;

/// Unique, string-typed bind addresses for one protocol, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: Vec<String>,
}

impl AddressSet {
    /// Keep string entries, dropping duplicates. Anything else is skipped with a
    /// warning rather than failing startup.
    pub fn sanitize(entries: &[Value]) -> Self {
        let mut addresses: Vec<String> = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.as_str() {
                Some(address) => {
                    if !addresses.iter().any(|known| known == address) {
                        addresses.push(address.to_string());
                    }
                }
                None => {
                    tracing::warn!(address = %entry, "Skipping invalid listener address");
                }
            }
        }
        Self { addresses }
    }

    /// Sanitize an optional config list; a missing list is an empty set.
    pub fn from_config(entries: Option<&[Value]>) -> Self {
        entries.map(Self::sanitize).unwrap_or_default()
    }

    /// Addresses to bind: the set itself, or the wildcard address when empty.
    pub fn bind_targets(&self) -> Vec<&str> {
        if self.addresses.is_empty() {
            vec![WILDCARD_ADDRESS]
        } else {
            self.addresses.iter().map(String::as_str).collect()
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.iter().any(|known| known == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }
}
