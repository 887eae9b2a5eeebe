//! TLS reload capability
//!
//! The rotator does not know how the host serves TLS. It is handed a
//! [`ReloadHook`] at construction and calls it once new material is on disk.

/// Swap the live TLS context for freshly rotated material
pub trait ReloadHook: Send + Sync {
    /// Returns `true` only if the new context is now in use
    fn reload(&self) -> bool;
}

impl<F> ReloadHook for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn reload(&self) -> bool {
        self()
    }
}
