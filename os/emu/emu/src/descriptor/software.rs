use super::{DescriptorError, DescriptorTable, LDT_ENTRIES, UserDesc};
use core::cell::RefCell;
use std::collections::BTreeMap;

/// A descriptor table that only remembers what was installed.
///
/// Used on hosts without LDT support, and by tests to observe exactly what
/// would have reached the hardware.
#[derive(Debug, Default)]
pub struct SoftwareTable {
    entries: RefCell<BTreeMap<u16, UserDesc>>,
}

impl SoftwareTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry currently installed in `slot`.
    #[must_use]
    pub fn entry(&self, slot: u16) -> Option<UserDesc> {
        self.entries.borrow().get(&slot).copied()
    }

    /// Number of installed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl DescriptorTable for SoftwareTable {
    fn name(&self) -> &'static str {
        "software"
    }

    fn install(&self, desc: &UserDesc) -> Result<(), DescriptorError> {
        let slot = desc.slot();
        if slot >= LDT_ENTRIES {
            return Err(DescriptorError::InvalidSlot(slot));
        }
        let mut entries = self.entries.borrow_mut();
        if desc.is_empty() {
            entries.remove(&slot);
        } else {
            entries.insert(slot, *desc);
        }
        Ok(())
    }
}
