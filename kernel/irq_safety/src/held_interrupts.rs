/// A handle for frozen interrupts
pub struct HeldInterrupts(bool);

/// Prevent interrupts from firing until return value is dropped (goes out of scope).
/// After it is dropped, the interrupts are returned to their prior state, not blindly re-enabled.
#[must_use = "interrupts are re-enabled as soon as the returned value is dropped"]
pub fn hold_interrupts() -> HeldInterrupts {
    let enabled = interrupts_enabled();
    let retval = HeldInterrupts(enabled);
    disable_interrupts();
    retval
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        if self.0 {
            enable_interrupts();
        }
    }
}


#[cfg(all(target_arch = "x86_64", not(any(test, feature = "host"))))]
mod arch {
    use x86_64::instructions::interrupts;

    pub fn interrupts_enabled() -> bool {
        interrupts::are_enabled()
    }

    pub fn enable_interrupts() {
        interrupts::enable();
    }

    pub fn disable_interrupts() {
        interrupts::disable();
    }
}

#[cfg(any(test, feature = "host"))]
mod arch {
    use std::cell::Cell;

    std::thread_local! {
        // every host thread stands in for one CPU
        static INTERRUPTS_ENABLED: Cell<bool> = Cell::new(true);
    }

    pub fn interrupts_enabled() -> bool {
        INTERRUPTS_ENABLED.with(|flag| flag.get())
    }

    pub fn enable_interrupts() {
        INTERRUPTS_ENABLED.with(|flag| flag.set(true));
    }

    pub fn disable_interrupts() {
        INTERRUPTS_ENABLED.with(|flag| flag.set(false));
    }
}

#[cfg(not(any(target_arch = "x86_64", test, feature = "host")))]
compile_error!("irq_safety: interrupt control is only implemented for x86_64");

/// Returns whether interrupts are enabled on the current CPU.
pub fn interrupts_enabled() -> bool {
    arch::interrupts_enabled()
}

/// enable interrupts
pub fn enable_interrupts() {
    arch::enable_interrupts();
}

/// disable interrupts
pub fn disable_interrupts() {
    arch::disable_interrupts();
}
