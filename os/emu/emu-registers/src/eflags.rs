use bitfield_struct::bitfield;

/// IA-32 EFLAGS as seen by the guest.
///
/// Guest code only ever observes the arithmetic flags and `IF`; the system
/// flags are kept so a saved flag word can be restored bit for bit.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Eflags {
    /// Carry Flag, also the error indicator of the syscall convention.
    pub cf_carry: bool, // 0

    /// Always 1.
    #[bits(default = true)]
    _always1: bool, // 1

    /// Parity Flag
    pub pf_parity: bool, // 2

    #[bits(default = false)]
    _rsvd3: bool, // 3

    /// Adjust Flag
    pub af_adjust: bool, // 4

    #[bits(default = false)]
    _rsvd5: bool, // 5

    /// Zero Flag
    pub zf_zero: bool, // 6

    /// Sign Flag
    pub sf_sign: bool, // 7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag; always set for user code.
    #[bits(default = true)]
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Nested Task
    pub nt_nested: bool, // 14

    #[bits(default = false)]
    _rsvd15: bool, // 15

    /// Resume Flag
    pub rf_resume: bool, // 16

    /// Virtual 8086 mode
    pub vm_virtual_8086: bool, // 17

    /// Alignment Check
    pub ac_alignment_check: bool, // 18

    /// Virtual Interrupt Flag
    pub vif_virtual_interrupt: bool, // 19

    /// Virtual Interrupt Pending
    pub vip_virtual_interrupt_pending: bool, // 20

    /// ID Flag
    pub id_cpuid: bool, // 21

    #[bits(10, default = 0)]
    _reserved_rest: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_fixed_bit_and_interrupts() {
        assert_eq!(Eflags::new().into_bits(), 0x0202);
    }

    #[test]
    fn carry_is_bit_zero() {
        let f = Eflags::new().with_cf_carry(true);
        assert_eq!(f.into_bits() & 1, 1);
        assert!(Eflags::from_bits(0x0203).cf_carry());
    }

    #[test]
    fn raw_bits_survive() {
        let raw = 0x0024_8AD7;
        assert_eq!(Eflags::from_bits(raw).into_bits(), raw);
    }
}
