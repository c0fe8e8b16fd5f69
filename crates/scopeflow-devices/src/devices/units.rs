/*!
 * Conversions between host units and drive units.
 */

/// Fastest focus speed on DMRXA/DMRA stands, in µm/s
pub const FAST_STAND_MAX_SPEED_UM_S: f64 = 4700.0;

/// Fastest focus speed on other stands, in µm/s
pub const MAX_SPEED_UM_S: f64 = 1175.0;

/// Largest constant-speed command value
pub const MAX_SPEED_NUMBER: i32 = 255;

/// Micrometers to drive steps, truncating toward zero
pub fn um_to_steps(um: f64, step_size_um: f64) -> i32 {
    // `as` saturates at the i32 bounds
    (um / step_size_um) as i32
}

/// Drive steps to micrometers
pub fn steps_to_um(steps: i32, step_size_um: f64) -> f64 {
    f64::from(steps) * step_size_um
}

/// Maximum focus speed for a microscope type
pub fn max_focus_speed(microscope: &str) -> f64 {
    match microscope.trim() {
        "DMRXA" | "DMRA" => FAST_STAND_MAX_SPEED_UM_S,
        _ => MAX_SPEED_UM_S,
    }
}

/// Scale a signed speed in µm/s to the drive's -255..=255 speed number
pub fn speed_to_speed_number(speed_um_s: f64, max_speed_um_s: f64) -> i32 {
    let number = (speed_um_s / max_speed_um_s * f64::from(MAX_SPEED_NUMBER)) as i32;
    number.clamp(-MAX_SPEED_NUMBER, MAX_SPEED_NUMBER)
}
