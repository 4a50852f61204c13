//! At-most-one-active-dependent checks.
//!
//! A connection admits one open transaction; a transaction admits one open
//! nested transaction; a large object admits one open stream. All three use
//! the functions here. This is a structural invariant checker for a
//! single-threaded owner, not a lock.

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Check that `new` may take a slot currently held by `current`.
pub fn check_unique_registration(new: Option<&Identity>, current: Option<&Identity>) -> Result<()> {
    let Some(new) = new else {
        return Err(Error::internal("NULL pointer registered"));
    };
    match current {
        None => Ok(()),
        Some(old) if old == new => Err(Error::usage(format!(
            "Started twice: {}",
            new.description()
        ))),
        Some(old) => Err(Error::usage(format!(
            "Started {} while {} still active",
            new.description(),
            old.description()
        ))),
    }
}

/// Check that `claimed` is the object currently holding the slot.
pub fn check_unique_unregistration(
    claimed: Option<&Identity>,
    current: Option<&Identity>,
) -> Result<()> {
    match (claimed, current) {
        (Some(claimed), Some(current)) if claimed == current => Ok(()),
        (None, None) => Ok(()),
        (None, Some(current)) => Err(Error::usage(format!(
            "Expected to close {}, but got NULL pointer instead",
            current.description()
        ))),
        (Some(claimed), None) => Err(Error::usage(format!(
            "Closed while not open: {}",
            claimed.description()
        ))),
        (Some(claimed), Some(current)) => Err(Error::usage(format!(
            "Closed {}; expected to close {}",
            claimed.description(),
            current.description()
        ))),
    }
}

/// A slot that holds at most one registered identity.
#[derive(Debug, Default)]
pub struct RegistrationSlot {
    current: Option<Identity>,
}

impl RegistrationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity holding the slot, if any.
    pub fn current(&self) -> Option<&Identity> {
        self.current.as_ref()
    }

    pub fn is_free(&self) -> bool {
        self.current.is_none()
    }

    /// Claim the slot for `new`; fails if anything already holds it.
    pub fn register(&mut self, new: &Identity) -> Result<()> {
        check_unique_registration(Some(new), self.current.as_ref())?;
        tracing::trace!(serial = new.serial(), "registered {}", new);
        self.current = Some(new.clone());
        Ok(())
    }

    /// Release the slot; fails unless `claimed` holds it.
    pub fn unregister(&mut self, claimed: &Identity) -> Result<()> {
        check_unique_unregistration(Some(claimed), self.current.as_ref())?;
        tracing::trace!(serial = claimed.serial(), "unregistered {}", claimed);
        self.current = None;
        Ok(())
    }
}
