//! Signal-triggered dumps.
//!
//! Installing a dump handler saves the previously installed action. When
//! the signal arrives, the handler records it, restores the previous action
//! so a fault inside the dump falls through to it instead of looping, dumps
//! every recorder, re-arms itself, and finally chains to the previous
//! handler if there was a real one.

use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::ptr;

use nix::sys::signal::Signal;

use crate::format::Buf;

crate::recorder!(pub(crate) SIGNALS, "signals", 32, "Information about signals");

const MAX_SIGNALS: usize = 64;

#[cfg(any(target_os = "linux", target_os = "android"))]
const OS_SIGNAL_MASK: isize = (1 << libc::SIGSTKFLT) | (1 << libc::SIGPWR);
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const OS_SIGNAL_MASK: isize = 1 << libc::SIGINFO;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const OS_SIGNAL_MASK: isize = 0;

/// Crash and user signals worth a dump on any supported platform.
const COMMON_SIGNAL_MASK: isize = (1 << libc::SIGQUIT)
    | (1 << libc::SIGILL)
    | (1 << libc::SIGABRT)
    | (1 << libc::SIGBUS)
    | (1 << libc::SIGSEGV)
    | (1 << libc::SIGSYS)
    | (1 << libc::SIGXCPU)
    | (1 << libc::SIGXFSZ)
    | (1 << libc::SIGUSR1)
    | (1 << libc::SIGUSR2)
    | OS_SIGNAL_MASK;

crate::tweak!(
    pub(crate) SIGNAL_MASK,
    "recorder_signals",
    COMMON_SIGNAL_MASK,
    "Default mask for signals"
);

struct OldActions([UnsafeCell<MaybeUninit<libc::sigaction>>; MAX_SIGNALS]);

// Written only while installing a handler for that signal, read only by the
// handler itself, which cannot run before the install completes.
unsafe impl Sync for OldActions {}

static OLD_ACTIONS: OldActions =
    OldActions([const { UnsafeCell::new(MaybeUninit::uninit()) }; MAX_SIGNALS]);

extern "C" fn dump_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    use std::fmt::Write as _;

    let name = Signal::try_from(sig)
        .map(|s| s.as_str())
        .unwrap_or("signal");
    let mut out = [0u8; 128];
    let mut buf = Buf::new(&mut out);
    let _ = write!(buf, "Received signal {name} ({sig}), dumping recorder\n");
    crate::dump::default_show(buf.bytes(), ptr::null_mut());

    crate::record!(SIGNALS, "Received signal %d, dumping recorder", sig);

    unsafe {
        let saved = OLD_ACTIONS.0[sig as usize].get() as *const libc::sigaction;

        // Restore the previous handler so a fault during the dump does not
        // re-enter this one.
        let mut save = MaybeUninit::<libc::sigaction>::uninit();
        libc::sigaction(sig, saved, save.as_mut_ptr());

        crate::dump::dump();

        let mut next = MaybeUninit::<libc::sigaction>::uninit();
        libc::sigaction(sig, save.as_ptr(), next.as_mut_ptr());
        let next = next.assume_init();

        // Chain to the previous handler if it was a real one.
        if next.sa_sigaction != libc::SIG_DFL && next.sa_sigaction != libc::SIG_IGN {
            if next.sa_flags & libc::SA_SIGINFO != 0 {
                let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    mem::transmute(next.sa_sigaction);
                f(sig, info, ucontext);
            } else {
                let f: extern "C" fn(libc::c_int) = mem::transmute(next.sa_sigaction);
                f(sig);
            }
        }
    }
}

/// Install a handler that dumps every recorder when `sig` arrives. The
/// previously installed action is saved and chained to.
pub fn dump_on_signal(sig: i32) {
    if sig < 0 || sig as usize >= MAX_SIGNALS {
        return;
    }
    // Register the signals recorder before the handler can ever fire.
    SIGNALS.get();
    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
        dump_handler;
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(
            sig,
            &action,
            OLD_ACTIONS.0[sig as usize].get() as *mut libc::sigaction,
        );
    }
}

/// Apply the environment configuration (`RECORDER_TRACES`,
/// `RECORDER_TWEAKS`, `RECORDER_DUMP`) and install dump handlers for the
/// common crash and user signals, plus `add`, minus `remove`, OR-ed with
/// the `recorder_signals` tweak. Call once startup is complete.
pub fn dump_on_common_signals(add: u64, remove: u64) {
    if let Ok(spec) = std::env::var("RECORDER_TRACES") {
        crate::config::trace_set(&spec);
    }
    if let Ok(spec) = std::env::var("RECORDER_TWEAKS") {
        crate::config::trace_set(&spec);
    }
    if let Ok(pattern) = std::env::var("RECORDER_DUMP") {
        crate::dump::background_dump(&pattern);
    }

    let signals = (add | SIGNAL_MASK.value() as u64) & !remove;
    crate::record!(
        SIGNALS,
        "Activating dump for signal mask 0x%lX",
        signals as usize
    );
    for sig in 0..MAX_SIGNALS as i32 {
        if signals & (1u64 << sig) != 0 {
            dump_on_signal(sig);
        }
    }
}
