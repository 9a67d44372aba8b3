use super::{MAGIC_PTR_SELECTOR, SYSCALL_OPCODE, TrapError, TrapInfo, TrapOutcome, TrapSink, TrapState};
use crate::context::GuestContext;
use crate::far_ptr::FarPointer;
use crate::handler::{Destination, Disposition, Message, MessageHandler, Syscall};
use crate::msg::MessageChannel;
use crate::session::Session;
use emu_registers::{Registers, SegmentRegister, Selector, Table};

/// Bytes of each request shown in `msg` trace output.
const MESSAGE_DUMP_LIMIT: usize = 256;

/// Called for traps nobody recognizes, after the diagnostic dump.
pub type DebugHook = Box<dyn FnMut(&GuestContext<'_>, &TrapInfo)>;

/// Decodes traps and routes syscalls to a [`MessageHandler`].
pub struct TrapDispatcher<'s, H> {
    session: &'s Session,
    handler: H,
    state: TrapState,
    debug_hook: Option<DebugHook>,
}

impl<'s, H: MessageHandler> TrapDispatcher<'s, H> {
    pub const fn new(session: &'s Session, handler: H) -> Self {
        Self {
            session,
            handler,
            state: TrapState::Native,
            debug_hook: None,
        }
    }

    #[must_use]
    pub fn with_debug_hook(mut self, hook: DebugHook) -> Self {
        self.debug_hook = Some(hook);
        self
    }

    #[must_use]
    pub const fn state(&self) -> TrapState {
        self.state
    }

    #[must_use]
    pub const fn session(&self) -> &'s Session {
        self.session
    }

    pub const fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Handle one trap. On [`TrapOutcome::Resume`], `regs` holds the state
    /// the guest continues with.
    pub fn dispatch(&mut self, regs: &mut Registers, info: &TrapInfo) -> TrapOutcome {
        self.state = TrapState::Trapped;
        let outcome = self.dispatch_trapped(regs, info);
        self.state = TrapState::Native;
        outcome
    }

    fn dispatch_trapped(&mut self, regs: &mut Registers, info: &TrapInfo) -> TrapOutcome {
        let cs = Selector::from(regs.cs);
        let session = self.session;
        let mut ctx = GuestContext::new(regs, session);
        if !cs.is_guest() {
            log::error!(target: "trap", "trap in host code at {:#06x}:{:#x}", cs.to_u16(), ctx.registers().eip);
            Self::dump_context(&ctx, info);
            return TrapOutcome::Fatal(TrapError::HostDefect { cs: cs.to_u16() });
        }
        let mut handled = migrate_pointer_selector(&mut ctx);

        let mut opcode = [0u8; 2];
        let at = FarPointer::new(ctx.registers().cs, ctx.registers().eip);
        if ctx.read_bytes(at, &mut opcode).is_ok() && opcode == SYSCALL_OPCODE {
            let outcome = self.syscall(&mut ctx);
            ctx.advance_ip(2);
            if !matches!(outcome, TrapOutcome::Resume) {
                return outcome;
            }
            handled = true;
        }

        if handled {
            return TrapOutcome::Resume;
        }

        log::error!(target: "trap", "unrecognized trap at {at} (signal {}, trap {:#x})", info.signal, info.trapno);
        Self::dump_context(&ctx, info);
        if let Some(hook) = self.debug_hook.as_mut() {
            hook(&ctx, info);
        }
        let r = ctx.registers();
        TrapOutcome::Fatal(TrapError::Unrecognized { cs: r.cs, eip: r.eip })
    }

    fn syscall(&mut self, ctx: &mut GuestContext<'_>) -> TrapOutcome {
        let r = *ctx.registers();
        ctx.set_return(0);

        let number = r.al();
        let Some(syscall) = Syscall::from_number(number) else {
            log::warn!(target: "unhandled", "unknown syscall {number} at {}", FarPointer::new(r.cs, r.eip));
            ctx.set_return(u32::MAX);
            ctx.set_carry(true);
            return TrapOutcome::Resume;
        };

        let channel = match MessageChannel::new(
            ctx.session(),
            r.ah(),
            FarPointer::new(r.ds, r.ebx),
            r.ch(),
            FarPointer::new(r.ds, r.esi),
        ) {
            Ok(channel) => channel,
            Err(fault) => {
                log::warn!(target: "msg", "bad chunk list: {fault}");
                ctx.set_syscall_error(fault.errno());
                return TrapOutcome::Resume;
            }
        };

        if log::log_enabled!(target: "msg", log::Level::Trace) {
            let mut dump = Vec::new();
            if channel.dump_send(&mut dump, MESSAGE_DUMP_LIMIT).is_ok() {
                log::trace!(target: "msg", "{syscall:?} to {}\n{}", Destination::decode(syscall, r.edx), String::from_utf8_lossy(&dump).trim_end());
            }
        }

        let message = Message {
            syscall,
            destination: Destination::decode(syscall, r.edx),
            channel: &channel,
            context: &mut *ctx,
        };
        match self.handler.handle(message) {
            Ok(Disposition::Resume) => TrapOutcome::Resume,
            Ok(Disposition::Terminate(status)) => TrapOutcome::Terminate(status),
            Ok(Disposition::Abort(reason)) => {
                log::error!(target: "trap", "{syscall:?} to {}: {reason}", Destination::decode(syscall, r.edx));
                TrapOutcome::Fatal(TrapError::Aborted(reason))
            }
            Err(fault) => {
                log::warn!(target: "msg", "{fault}");
                ctx.set_syscall_error(fault.errno());
                TrapOutcome::Resume
            }
        }
    }

    fn dump_context(ctx: &GuestContext<'_>, info: &TrapInfo) {
        let mut err = std::io::stderr().lock();
        if let Err(e) = ctx.dump(&mut err, Some(info)) {
            log::error!(target: "trap", "dump failed: {e}");
        }
    }
}

/// Move a data segment register off the global-table pointer selector onto
/// the same slot in the local table.
fn migrate_pointer_selector(ctx: &mut GuestContext<'_>) -> bool {
    let migrated = Selector::from(MAGIC_PTR_SELECTOR).with_ti(Table::Ldt).to_u16();
    let mut handled = false;
    for reg in SegmentRegister::DATA {
        if ctx.registers().segment(reg) == MAGIC_PTR_SELECTOR {
            log::debug!(target: "trap", "{reg}: migrating {MAGIC_PTR_SELECTOR:#06x} to {migrated:#06x}");
            ctx.registers_mut().set_segment(reg, migrated);
            handled = true;
        }
    }
    handled
}

impl<H: MessageHandler> TrapSink for TrapDispatcher<'static, H> {
    fn dispatch(&mut self, regs: &mut Registers, info: &TrapInfo) -> TrapOutcome {
        Self::dispatch(self, regs, info)
    }
}
