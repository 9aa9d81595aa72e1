//! Clock helpers. Timestamps are 100 ns ticks since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Ticks per second.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Offsets closer than this to the stored one are not persisted.
pub const MAX_TIME_OFFSET_NOISE: i64 = TICKS_PER_SECOND as i64;

/// Current wall-clock time in ticks.
pub fn now_ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as u64)
        .unwrap_or(0)
}

/// Masks a device id for logging, keeping a short prefix.
pub fn mask_device(device: &str) -> String {
    let prefix: String = device.chars().take(3).collect();
    if device.chars().count() <= 3 {
        format!("{prefix}**")
    } else {
        format!("{prefix}***")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance() {
        let a = now_ticks();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(now_ticks() > a);
    }

    #[test]
    fn device_ids_are_masked() {
        assert_eq!(mask_device("device-abcdef"), "dev***");
        assert_eq!(mask_device("ab"), "ab**");
    }
}
