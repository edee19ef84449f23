use std::fs::File;
use std::io::Write;
use std::path::Path;
use chrono::{DateTime, Utc};
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use tracing::info;

use crate::config::MM_TO_M;
use crate::devices::{GeneralInfoResponse, ProfileResponse, SpeedOfSoundResponse};

pub const CSV_HEADER: [&str; 13] = [
    "time",
    "distance",
    "confidence",
    "transmit_duration",
    "ping_number",
    "max_range",
    "gain_setting",
    "profile_data",
    "speed_of_sound",
    "firmware_version_major",
    "firmware_version_minor",
    "ping_interval",
    "mode_auto",
];

pub fn mm_to_m(mm: u32) -> f64 {
    f64::from(mm) * MM_TO_M
}

/// One acquisition cycle's result, in SI units except where noted.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub distance_m: f64,
    pub confidence: u16,          // %
    pub transmit_duration_us: u16,
    pub ping_number: u32,         // pings since boot
    pub scan_start_m: f64,
    pub scan_length_m: f64,
    pub max_range_m: f64,
    pub gain_setting: u32,
    pub profile_data: Vec<u8>,
    pub speed_of_sound_m_s: f64,
    pub firmware_version_major: u16,
    pub firmware_version_minor: u16,
    pub ping_interval_ms: u16,
    pub mode_auto: u8,            // 0: manual, 1: auto
}

impl Measurement {
    /// Builds a measurement from one profile plus the device-wide queries of the same cycle.
    ///
    /// A missing speed-of-sound reply yields 0.0 m/s; missing general info yields
    /// zeroed firmware, ping interval and mode fields and leaves the profile's gain.
    pub fn from_responses(
        timestamp: DateTime<Utc>,
        profile: ProfileResponse,
        speed: Option<&SpeedOfSoundResponse>,
        info: Option<&GeneralInfoResponse>,
    ) -> Self {
        let scan_start_m = mm_to_m(profile.scan_start);
        let scan_length_m = mm_to_m(profile.scan_length);
        let info = info.copied();

        Measurement {
            timestamp,
            distance_m: mm_to_m(profile.distance),
            confidence: profile.confidence,
            transmit_duration_us: profile.transmit_duration,
            ping_number: profile.ping_number,
            scan_start_m,
            scan_length_m,
            max_range_m: scan_start_m + scan_length_m,
            gain_setting: info
                .map(|i| u32::from(i.gain_setting))
                .unwrap_or(profile.gain_setting),
            profile_data: profile.profile_data,
            speed_of_sound_m_s: speed.map(|s| mm_to_m(s.speed_of_sound)).unwrap_or(0.0),
            firmware_version_major: info.map(|i| i.firmware_version_major).unwrap_or(0),
            firmware_version_minor: info.map(|i| i.firmware_version_minor).unwrap_or(0),
            ping_interval_ms: info.map(|i| i.ping_interval).unwrap_or(0),
            mode_auto: info.map(|i| i.mode_auto).unwrap_or(0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CsvRecord {
    pub time: f64, // UNIX seconds
    pub distance: f64,
    pub confidence: u16,
    pub transmit_duration: u16,
    pub ping_number: u32,
    pub max_range: f64,
    pub gain_setting: u32,
    pub profile_data: String, // hex
    pub speed_of_sound: f64,
    pub firmware_version_major: u16,
    pub firmware_version_minor: u16,
    pub ping_interval: u16,
    pub mode_auto: u8,
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

impl From<&Measurement> for CsvRecord {
    fn from(m: &Measurement) -> Self {
        CsvRecord {
            time: m.timestamp.timestamp_micros() as f64 / 1e6,
            distance: m.distance_m,
            confidence: m.confidence,
            transmit_duration: m.transmit_duration_us,
            ping_number: m.ping_number,
            max_range: m.max_range_m,
            gain_setting: m.gain_setting,
            profile_data: to_hex(&m.profile_data),
            speed_of_sound: m.speed_of_sound_m_s,
            firmware_version_major: m.firmware_version_major,
            firmware_version_minor: m.firmware_version_minor,
            ping_interval: m.ping_interval_ms,
            mode_auto: m.mode_auto,
        }
    }
}

/// Append-only CSV log. The header goes out once, when the sink is created.
pub struct CsvSink<W: Write> {
    writer: Writer<W>,
    rows: u64,
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> csv::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        info!("Logging measurements to {}", path.display());
        Self::from_writer(file)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(inner: W) -> csv::Result<Self> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(inner);
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;
        Ok(CsvSink { writer, rows: 0 })
    }

    pub fn write(&mut self, measurement: &Measurement) -> csv::Result<()> {
        self.writer.serialize(CsvRecord::from(measurement))?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    #[cfg(test)]
    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner().ok()
    }
}
