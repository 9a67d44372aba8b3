mod common;

use emu::handler::{Destination, Disposition, Message, Syscall};
use emu::trap::{SYSCALL_OPCODE, TrapInfo, TrapOutcome};
use emu_memory::Access;
use emu::{Errno, GuestFault, RwOp, TrapDispatcher, TrapError};
use emu_registers::Registers;

/// `send` of "ping!" to pid `pid` with a 16 byte reply buffer, lists in DS.
fn send_call(session: &emu::Session, pid: u32) -> Registers {
    let (mut regs, ds) = common::guest(session, &SYSCALL_OPCODE);
    common::write(session, ds, 0x400, b"ping!");
    common::write_chunk_list(session, emu::FarPointer::new(ds.to_u16(), 0x100), &[(ds, 0x400, 5)]);
    common::write_chunk_list(session, emu::FarPointer::new(ds.to_u16(), 0x200), &[(ds, 0x600, 16)]);
    regs.set_al(0);
    regs.set_ah(1);
    regs.set_ch(1);
    regs.ebx = 0x100;
    regs.esi = 0x200;
    regs.edx = pid;
    regs.eax |= 0xAB00_0000;
    regs
}

#[test]
fn syscall_reaches_handler_and_advances_ip() {
    let (session, _) = common::session();
    let mut regs = send_call(&session, 7);
    let mut seen = Vec::new();

    let outcome = TrapDispatcher::new(&session, |msg: Message<'_, '_>| -> Result<Disposition, GuestFault> {
        assert_eq!(msg.syscall, Syscall::Send);
        assert_eq!(msg.destination, Destination::ByProcess(7));
        assert_eq!(msg.context.registers().eax, 0, "return register is cleared");
        let mut buf = [0u8; 5];
        msg.channel.read(&mut buf, 0)?;
        seen.extend_from_slice(&buf);
        msg.channel.write(0, b"pong")?;
        msg.context.set_return(42);
        Ok(Disposition::Resume)
    })
    .dispatch(&mut regs, &TrapInfo::default());

    assert!(matches!(outcome, TrapOutcome::Resume));
    assert_eq!(seen, b"ping!");
    assert_eq!(regs.eip, 2);
    assert_eq!(regs.eax, 42);
    let ds = emu_registers::Selector::from(regs.ds);
    assert_eq!(common::read(&session, ds, 0x600, 4), b"pong");
}

#[test]
fn fd_send_decodes_destination() {
    let (session, _) = common::session();
    let mut regs = send_call(&session, 3);
    regs.set_al(11);
    let mut destination = None;
    let _ = TrapDispatcher::new(&session, |msg: Message<'_, '_>| -> Result<Disposition, GuestFault> {
        destination = Some(msg.destination);
        Ok(Disposition::Resume)
    })
    .dispatch(&mut regs, &TrapInfo::default());
    assert_eq!(destination, Some(Destination::ByFileDescriptor(3)));
}

#[test]
fn guest_fault_in_handler_becomes_efault() {
    let (session, _) = common::session();
    let mut regs = send_call(&session, 1);
    let outcome = TrapDispatcher::new(&session, |_: Message<'_, '_>| -> Result<Disposition, GuestFault> {
        Err(GuestFault::Unbound { selector: 0x1234 })
    })
    .dispatch(&mut regs, &TrapInfo::default());

    assert!(matches!(outcome, TrapOutcome::Resume));
    assert_eq!(regs.eax, u32::from(Errno::EFAULT.raw()));
    assert!(regs.eflags.cf_carry());
    assert_eq!(regs.eip, 2);
}

#[test]
fn unreadable_chunk_list_becomes_efault() {
    let (session, _) = common::session();
    let mut regs = send_call(&session, 1);
    regs.ebx = 0xFFFF_FF00;
    let outcome = TrapDispatcher::new(&session, |_: Message<'_, '_>| -> Result<Disposition, GuestFault> {
        panic!("handler must not run");
    })
    .dispatch(&mut regs, &TrapInfo::default());

    assert!(matches!(outcome, TrapOutcome::Resume));
    assert_eq!(regs.eax, u32::from(Errno::EFAULT.raw()));
    assert!(regs.eflags.cf_carry());
}

#[test]
fn terminate_is_passed_through() {
    let (session, _) = common::session();
    let mut regs = send_call(&session, 1);
    let outcome = TrapDispatcher::new(&session, |_: Message<'_, '_>| -> Result<Disposition, GuestFault> {
        Ok(Disposition::Terminate(3))
    })
        .dispatch(&mut regs, &TrapInfo::default());
    assert!(matches!(outcome, TrapOutcome::Terminate(3)));
}

#[test]
fn guest_code_segment_is_executable_and_holds_the_trap() {
    let (session, _) = common::session();
    let (regs, _) = common::guest(&session, &SYSCALL_OPCODE);
    let cs = emu_registers::Selector::from(regs.cs);
    let descriptor = session.descriptor(cs).unwrap();
    assert_eq!(descriptor.segment().access(), Access::ExecRead);
    assert_eq!(common::read(&session, cs, 0, 2), SYSCALL_OPCODE);
    assert!(session.translate(cs, 0, 2, RwOp::Write).is_err());
}

#[test]
fn abort_stops_the_guest() {
    let (session, _) = common::session();
    let mut regs = send_call(&session, 1);
    let outcome = TrapDispatcher::new(&session, |_: Message<'_, '_>| -> Result<Disposition, GuestFault> {
        Ok(Disposition::Abort("out of address space"))
    })
    .dispatch(&mut regs, &TrapInfo::default());
    assert!(matches!(outcome, TrapOutcome::Fatal(TrapError::Aborted("out of address space"))));
}
