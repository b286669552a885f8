//! Platform services the transfer engine depends on
//!
//! Timekeeping, deferred-task scheduling and the wait/notify hooks used by
//! the abort rendezvous.

/// Services supplied by the embedding environment
pub trait Platform {
    /// Sleep (or busy-wait) for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32);

    /// Monotonic millisecond clock
    fn now_ms(&self) -> u64;

    /// Arrange for [`crate::drivers::usb::ohci::OhciController::softintr`]
    /// to run soon in task context.
    ///
    /// Called from the interrupt top half; must not block.
    fn schedule_softintr(&self);

    /// Block until [`Platform::notify_event`] is called or a short while
    /// passes. Spurious wakeups are fine.
    ///
    /// Abort and completion-pass waiters park here. An environment with no
    /// scheduler may spin, but then the engine should be driven through
    /// [`crate::drivers::usb::ohci::OhciController::poll`].
    fn wait_event(&self);

    /// Wake every thread parked in [`Platform::wait_event`]
    fn notify_event(&self);
}
