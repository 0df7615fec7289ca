use super::protocol::{PinCommand, FIELD_MAX, FIELD_MIN, MIN_VELOCITY};

/// Clamp a single field into the device's accepted range.
pub fn check_limits(value: i64) -> i64 {
    value.clamp(FIELD_MIN, FIELD_MAX)
}

/// Bring every field of an untrusted command into range.
///
/// Never fails: out-of-range values are corrected silently and the ramp
/// velocity is raised to at least one. Every command must pass through here
/// before it reaches a link.
pub fn validate(command: PinCommand) -> PinCommand {
    let validated = PinCommand {
        active: check_limits(command.active),
        number: check_limits(command.number),
        is_analog: check_limits(command.is_analog),
        is_output: check_limits(command.is_output),
        current: check_limits(command.current),
        target: check_limits(command.target),
        velocity: check_limits(command.velocity).max(MIN_VELOCITY),
    };

    if validated != command {
        log::debug!("Clamped pin command {:?} to {:?}", command, validated);
    }
    validated
}
