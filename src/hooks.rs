//! External hook registration (spec §6's `install_traphandler(fn)`):
//! the one point where the core hands control to surrounding layers
//! for device IRQs it doesn't otherwise know how to classify.
//!
//! Grounded on the teacher's `plic.rs`/`devintr` dispatch-by-vector
//! pattern, generalized from a hard-coded device list to a single
//! externally-registered hook, since the core has no concept of
//! devices — only "timer, TLB-shootdown, or other".

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::trap::TrapFrame;

type TrapHook = unsafe fn(*mut TrapFrame);

unsafe fn default_newtrap(_frame: *mut TrapFrame) {}

static NEWTRAP: AtomicUsize = AtomicUsize::new(default_newtrap as usize);

/// Register the hook invoked for every maskable IRQ other than timer
/// and TLB-shootdown (spec §6). Overwrites any previously installed
/// hook; callers are expected to install exactly one, during boot.
pub fn install_traphandler(f: unsafe fn(*mut TrapFrame)) {
    NEWTRAP.store(f as usize, Ordering::Release);
}

/// Invoke the currently installed hook. A no-op until something calls
/// [`install_traphandler`].
pub unsafe fn newtrap(frame: *mut TrapFrame) {
    let ptr = NEWTRAP.load(Ordering::Acquire);
    let f: TrapHook = core::mem::transmute(ptr);
    f(frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_a_harmless_noop() {
        assert_eq!(NEWTRAP.load(Ordering::Relaxed), default_newtrap as usize);
    }
}
