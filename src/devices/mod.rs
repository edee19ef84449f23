pub mod ping1d;
pub mod protocol;
pub mod transport;

pub use ping1d::Ping1D;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PingError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    SerialError(#[from] serialport::Error),

    #[error("Timed out waiting for message {0}")]
    Timeout(u16),

    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },

    #[error("Device rejected message {id}: {reason}")]
    Nack { id: u16, reason: String },

    #[error("Malformed message {id}: {reason}")]
    Malformed { id: u16, reason: String },

    #[error("Device reports {field} = {actual}, expected {expected}")]
    VerifyMismatch {
        field: &'static str,
        expected: u32,
        actual: u32,
    },
}

pub type Result<T> = std::result::Result<T, PingError>;

/// One profile response. Lengths are in millimeters, transmit duration in microseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileResponse {
    pub distance: u32,
    pub confidence: u16,
    pub transmit_duration: u16,
    pub ping_number: u32,
    pub scan_start: u32,
    pub scan_length: u32,
    pub gain_setting: u32,
    pub profile_data: Vec<u8>,
}

/// Speed of sound in mm/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeedOfSoundResponse {
    pub speed_of_sound: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeResponse {
    pub scan_start: u32,
    pub scan_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeneralInfoResponse {
    pub firmware_version_major: u16,
    pub firmware_version_minor: u16,
    pub voltage_5: u16,
    pub ping_interval: u16,
    pub gain_setting: u8,
    pub mode_auto: u8,
}

/// Request/response contract of a single-beam ranging device.
///
/// Getters return `None` when the device gave no usable answer (timeout,
/// rejection or a malformed reply); the failure itself is logged by the
/// implementation.
pub trait PingDevice {
    fn initialize(&mut self) -> bool;

    fn set_speed_of_sound(&mut self, speed_of_sound_mm_s: u32) -> Result<()>;
    fn set_range(&mut self, scan_start_mm: u32, scan_length_mm: u32) -> Result<()>;
    fn set_ping_interval(&mut self, ping_interval_ms: u16) -> Result<()>;
    fn set_gain_setting(&mut self, gain_setting: u8) -> Result<()>;
    fn set_mode_auto(&mut self, mode_auto: u8) -> Result<()>;

    fn get_profile(&mut self) -> Option<ProfileResponse>;
    fn get_speed_of_sound(&mut self) -> Option<SpeedOfSoundResponse>;
    fn get_general_info(&mut self) -> Option<GeneralInfoResponse>;
}
