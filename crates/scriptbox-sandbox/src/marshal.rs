//! Marshaling layer for the guest/host boundary.
//!
//! Every value that crosses the boundary is copied as JSON text, bounded in
//! size. Host resources the guest may refer to later (response bodies, timers)
//! are kept in a [`HandleTable`] and represented in the guest only by an
//! opaque numeric [`HandleId`]. No host object, function, or prototype is ever
//! reachable from guest code.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while copying values across the boundary.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// The serialized value exceeds its size ceiling.
    #[error("{what} too large ({actual} bytes, max {max} bytes)")]
    TooLarge {
        /// What was being copied.
        what: &'static str,
        /// Size ceiling.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The guest sent something that is not the expected JSON shape.
    #[error("invalid {what}: {source}")]
    Invalid {
        /// What was being copied.
        what: &'static str,
        /// Underlying parse failure.
        source: serde_json::Error,
    },

    /// A host value could not be serialized.
    #[error("{what} is not serializable: {source}")]
    NotSerializable {
        /// What was being copied.
        what: &'static str,
        /// Underlying serialization failure.
        source: serde_json::Error,
    },

    /// The guest referred to a handle that does not exist (or was consumed).
    #[error("unknown or consumed handle {0}")]
    UnknownHandle(HandleId),
}

/// Deep-copy a guest JSON payload into a host value.
pub fn copy_in<T: DeserializeOwned>(
    what: &'static str,
    json: &str,
    max: usize,
) -> Result<T, MarshalError> {
    if json.len() > max {
        return Err(MarshalError::TooLarge {
            what,
            max,
            actual: json.len(),
        });
    }
    serde_json::from_str(json).map_err(|source| MarshalError::Invalid { what, source })
}

/// Deep-copy a host value into JSON text for the guest.
pub fn copy_out<T: Serialize + ?Sized>(
    what: &'static str,
    value: &T,
    max: usize,
) -> Result<String, MarshalError> {
    let json = serde_json::to_string(value)
        .map_err(|source| MarshalError::NotSerializable { what, source })?;
    if json.len() > max {
        return Err(MarshalError::TooLarge {
            what,
            max,
            actual: json.len(),
        });
    }
    Ok(json)
}

/// Opaque reference to a host-held resource, as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-context table of host resources addressed by [`HandleId`].
///
/// Ids start at 1 and are never reused within a table, so a stale id held by
/// the guest can never alias a newer resource.
#[derive(Debug)]
pub struct HandleTable<T> {
    next: u32,
    entries: HashMap<u32, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }
}

impl<T> HandleTable<T> {
    /// Store a resource and return its id.
    pub fn insert(&mut self, value: T) -> HandleId {
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        self.entries.insert(id, value);
        HandleId(id)
    }

    /// Remove and return a resource. One-shot resources use this.
    pub fn take(&mut self, id: HandleId) -> Result<T, MarshalError> {
        self.entries
            .remove(&id.0)
            .ok_or(MarshalError::UnknownHandle(id))
    }

    /// Borrow a resource mutably without consuming it.
    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut T> {
        self.entries.get_mut(&id.0)
    }

    /// Remove a resource if present, returning whether it existed.
    pub fn remove(&mut self, id: HandleId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain every live resource.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn copy_in_rejects_oversized_payload() {
        let err = copy_in::<Value>("fetch options", "[1,2,3,4]", 4).unwrap_err();
        assert!(matches!(
            err,
            MarshalError::TooLarge {
                max: 4,
                actual: 9,
                ..
            }
        ));
    }

    #[test]
    fn copy_in_rejects_malformed_json() {
        let err = copy_in::<Value>("console args", "{not json", 1024).unwrap_err();
        assert!(err.to_string().starts_with("invalid console args"));
    }

    #[test]
    fn copy_out_enforces_limit() {
        let big = "x".repeat(64);
        assert!(copy_out("result", &big, 16).is_err());
        assert_eq!(copy_out("result", &"hi", 16).unwrap(), "\"hi\"");
    }

    #[test]
    fn handles_are_one_shot() {
        let mut table = HandleTable::default();
        let id = table.insert("body");
        assert_eq!(id, HandleId(1));
        assert_eq!(table.take(id).unwrap(), "body");
        assert!(matches!(
            table.take(id),
            Err(MarshalError::UnknownHandle(HandleId(1)))
        ));
    }

    #[test]
    fn handle_ids_are_not_reused() {
        let mut table = HandleTable::default();
        let a = table.insert(1);
        assert!(table.remove(a));
        let b = table.insert(2);
        assert_ne!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.drain().collect::<Vec<_>>(), vec![2]);
        assert!(table.is_empty());
    }
}
