//! Formatted output helpers for CLI commands.
//!
//! Human-readable byte and duration formatting, and the mapping from a
//! container's final state to the process exit code.

use strata_common::types::{ContainerState, FailureReason};

/// Exit code reported when the container never reached exec.
pub const SETUP_FAILURE_EXIT: u8 = 125;

/// `SIGKILL`, delivered by the group's OOM killer.
const OOM_KILL_SIGNAL: i32 = 9;

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Formats CPU microseconds as milliseconds or seconds.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_usec(usec: u64) -> String {
    if usec >= 1_000_000 {
        format!("{:.2}s", usec as f64 / 1_000_000.0)
    } else {
        format!("{}ms", usec / 1_000)
    }
}

/// Shell-style exit code for a terminal container state.
#[must_use]
pub fn exit_code(state: &ContainerState) -> u8 {
    match state {
        ContainerState::Exited { code } => u8::try_from(code & 0xff).unwrap_or(1),
        ContainerState::Failed { reason } => match reason {
            FailureReason::Setup { .. } => SETUP_FAILURE_EXIT,
            FailureReason::OutOfMemory => signal_exit(OOM_KILL_SIGNAL),
            FailureReason::Crashed { signal } | FailureReason::Terminated { signal } => {
                signal_exit(*signal)
            }
        },
        ContainerState::Created | ContainerState::Running => 1,
    }
}

fn signal_exit(signal: i32) -> u8 {
    u8::try_from(128 + signal).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_displays_bytes() {
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn format_bytes_displays_mib() {
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
    }

    #[test]
    fn format_usec_switches_to_seconds() {
        assert_eq!(format_usec(42_000), "42ms");
        assert_eq!(format_usec(2_500_000), "2.50s");
    }

    #[test]
    fn exit_codes_follow_shell_conventions() {
        assert_eq!(exit_code(&ContainerState::Exited { code: 0 }), 0);
        assert_eq!(exit_code(&ContainerState::Exited { code: 3 }), 3);
        assert_eq!(
            exit_code(&ContainerState::Failed {
                reason: FailureReason::OutOfMemory
            }),
            137
        );
        assert_eq!(
            exit_code(&ContainerState::Failed {
                reason: FailureReason::Terminated { signal: 15 }
            }),
            143
        );
        assert_eq!(
            exit_code(&ContainerState::Failed {
                reason: FailureReason::Setup {
                    message: "exec".into()
                }
            }),
            SETUP_FAILURE_EXIT
        );
    }
}
