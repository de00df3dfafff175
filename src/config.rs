//! Engine configuration.

use crate::hash::Key;

/// Number of extra attempts for a failed flash operation before the swap is aborted.
pub const DEFAULT_RETRIES: u8 = 2;

#[derive(Clone, Debug)]
pub struct Config {
    /// Secret mixed into every block digest and into the status area seal.
    ///
    /// Must be the same for every boot that may resume the swap.
    pub key: Key,
    pub retries: u8,
}

impl Config {
    pub const fn new(key: Key) -> Self {
        Self {
            key,
            retries: DEFAULT_RETRIES,
        }
    }

    pub const fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }
}
