//! Disk space preflight.
//!
//! The required space is checked independently at the install destination
//! and at the temp root, since the fetcher fills the temp directory and the
//! swap then needs the same bytes next to the destination.

/// Fixed part of the safety margin (100 MiB).
pub const SAFETY_MARGIN_BYTES: u64 = 100 * 1024 * 1024;

/// Required bytes plus the safety margin (10% + 100 MiB).
#[must_use]
pub fn required_with_margin(required: u64) -> u64 {
    required
        .saturating_add(required / 10)
        .saturating_add(SAFETY_MARGIN_BYTES)
}

/// Free space measured before an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCheck {
    /// Bytes the fetcher will write.
    pub required: u64,
    /// Free bytes at the destination, `None` if unknown.
    pub free_in_destination: Option<u64>,
    /// Free bytes at the temp root, `None` if unknown.
    pub free_in_temp: Option<u64>,
}

impl DiskCheck {
    /// Returns true if a known free figure is below the requirement.
    ///
    /// Unknown figures never block.
    #[must_use]
    pub fn is_insufficient(&self) -> bool {
        if self.required == 0 {
            return false;
        }
        let needed = required_with_margin(self.required);
        self.free_in_destination.is_some_and(|free| free < needed)
            || self.free_in_temp.is_some_and(|free| free < needed)
    }
}
