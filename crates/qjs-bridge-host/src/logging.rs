//! Guest output host function implementation.
//!
//! The guest's `print` and `console.*` write through `env.host_log` in
//! fragments. Complete lines are:
//! 1. Emitted via the `tracing` crate as `guest_log` events
//! 2. Passed to the machine's log handler, if one is installed

use qjs_bridge_core::MachineState;

/// Host implementation for `env.host_log`.
pub struct LoggingHost;

impl LoggingHost {
    /// Append a guest output fragment and deliver every completed line.
    ///
    /// Returns the number of lines delivered.
    pub fn write(state: &mut MachineState, fragment: &[u8]) -> usize {
        let machine_id = state.machine_id();
        let log = state.log_mut();

        let lines = log.push(fragment);
        for line in &lines {
            log.deliver(machine_id, line);
        }
        lines.len()
    }

    /// Deliver a pending unterminated line, if any.
    pub fn flush(state: &mut MachineState) -> bool {
        let machine_id = state.machine_id();
        let log = state.log_mut();

        match log.flush() {
            Some(line) => {
                log.deliver(machine_id, &line);
                true
            }
            None => false,
        }
    }
}
