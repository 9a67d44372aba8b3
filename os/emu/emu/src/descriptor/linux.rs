use super::{DescriptorError, DescriptorTable, LDT_ENTRIES, UserDesc};
use std::io;

/// `modify_ldt` function: write an entry using the `user_desc` format.
const MODIFY_LDT_WRITE: libc::c_long = 0x11;

/// The calling process's local descriptor table.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinuxLdt;

impl DescriptorTable for LinuxLdt {
    fn name(&self) -> &'static str {
        "ldt"
    }

    fn install(&self, desc: &UserDesc) -> Result<(), DescriptorError> {
        let slot = desc.slot();
        if slot >= LDT_ENTRIES {
            return Err(DescriptorError::InvalidSlot(slot));
        }
        let rc = unsafe {
            libc::syscall(
                libc::SYS_modify_ldt,
                MODIFY_LDT_WRITE,
                core::ptr::from_ref(desc),
                size_of::<UserDesc>(),
            )
        };
        if rc != 0 {
            return Err(DescriptorError::Rejected {
                slot,
                source: io::Error::last_os_error(),
            });
        }
        log::trace!(
            target: "segment",
            "ldt[{slot}] base={:#x} limit={:#x} flags={:#x}",
            desc.base_addr,
            desc.limit,
            desc.flags.into_bits()
        );
        Ok(())
    }

    fn is_hardware(&self) -> bool {
        true
    }
}
