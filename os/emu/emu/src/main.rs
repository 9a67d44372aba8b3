//! # `lmfrun`
//!
//! ```text
//! lmfrun <image> [args...]
//! ```
//!
//! Loads the system library named by `LMF_SLIB` (if any), then `<image>`,
//! and runs the image with `args`. Logging is configured through
//! `LMF_LOG` and `LMF_LOG_LEVEL`; see [`emu::config`].

use emu::startup;
use emu::trap::TrapBackend;
use emu::{
    Config, EngineError, GuestContext, ImageKind, Loader, ProcHandler, Session, TrapDispatcher,
};
use emu_log::StderrLogger;
use std::convert::Infallible;
use std::env;
use std::error::Error;
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("lmfrun: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = StderrLogger::new(config.log_level, &config.log_categories).init() {
        eprintln!("lmfrun: {e}");
    }

    let mut args = env::args_os().skip(1);
    let Some(image) = args.next() else {
        eprintln!("usage: lmfrun <image> [args...]");
        return ExitCode::from(2);
    };

    match run(config, image, args.collect()) {
        Ok(never) => match never {},
        Err(e) => {
            let mut message = format!("lmfrun: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                message.push_str(&format!(": {cause}"));
                source = cause.source();
            }
            log::error!("{message}");
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config, image: OsString, args: Vec<OsString>) -> Result<Infallible, EngineError> {
    let session: &'static Session = Box::leak(Box::new(Session::from_config(config)));
    let loader = Loader::new(session);

    if let Some(slib) = session.config().system_library.clone() {
        loader.load_file(&slib, ImageKind::SystemLibrary)?;
    }
    let path = PathBuf::from(&image);
    let main = loader.load_file(&path, ImageKind::Main)?;
    startup::install_pointer_segment(session)?;

    let guest_args: Vec<Vec<u8>> = std::iter::once(image)
        .chain(args)
        .map(OsStringExt::into_vec)
        .collect();
    let guest_env: Vec<Vec<u8>> = env::vars_os()
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            entry
        })
        .collect();

    let mut regs = main.startup_registers();
    startup::push_startup_frame(&mut GuestContext::new(&mut regs, session), &guest_args, &guest_env)?;

    let dispatcher = TrapDispatcher::new(session, ProcHandler::new());
    let mut backend = backend(session)?;
    log::debug!(target: "trap", "using {} backend", backend.name());
    Ok(backend.enter(Box::new(dispatcher), regs)?)
}

/// The signal backend runs guest code natively, so it needs the segments in
/// the CPU's descriptor table.
#[cfg(all(feature = "ldt", target_os = "linux", target_arch = "x86_64"))]
fn backend(session: &Session) -> Result<Box<dyn TrapBackend>, EngineError> {
    if !session.descriptor_table().is_hardware() {
        return Err(emu::TrapError::Unavailable("signal").into());
    }
    Ok(Box::new(emu::trap::SignalBackend::new()))
}

#[cfg(not(all(feature = "ldt", target_os = "linux", target_arch = "x86_64")))]
fn backend(_session: &Session) -> Result<Box<dyn TrapBackend>, EngineError> {
    Err(emu::TrapError::Unavailable("signal").into())
}
