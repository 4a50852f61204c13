//! Human-readable identities for stateful objects.
//!
//! Every connection, transaction, invocation and large-object stream carries
//! an [`Identity`]. The registration guard compares identities to decide
//! whether two handles are the same object, and error messages use
//! [`Identity::description`] to name the objects involved.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Class name plus optional user-chosen name, made unique by a serial.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    serial: u64,
    classname: &'static str,
    name: String,
}

impl Identity {
    /// Create a fresh identity. Two calls never return equal identities.
    pub fn new(classname: &'static str, name: impl Into<String>) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            classname,
            name: name.into(),
        }
    }

    /// Process-unique serial number.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn classname(&self) -> &'static str {
        self.classname
    }

    /// User-chosen name; may be empty.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Transaction 'nightly-load'`, or just `Transaction` when unnamed.
    pub fn description(&self) -> String {
        if self.name.is_empty() {
            self.classname.to_string()
        } else {
            format!("{} '{}'", self.classname, self.name)
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// An object with an [`Identity`].
pub trait Named {
    fn identity(&self) -> &Identity;

    fn classname(&self) -> &'static str {
        self.identity().classname()
    }

    fn name(&self) -> &str {
        self.identity().name()
    }

    fn description(&self) -> String {
        self.identity().description()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_includes_name_when_present() {
        assert_eq!(Identity::new("Transaction", "").description(), "Transaction");
        assert_eq!(
            Identity::new("Transaction", "load").description(),
            "Transaction 'load'"
        );
    }

    #[test]
    fn identities_with_same_name_differ() {
        let a = Identity::new("Transaction", "x");
        let b = Identity::new("Transaction", "x");
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
        assert!(b.serial() > a.serial());
    }
}
