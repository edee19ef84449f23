use std::path::PathBuf;
use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Millimeters to meters.
pub const MM_TO_M: f64 = 0.001;
pub const MM_PER_M: f64 = 1000.0;

pub const MIN_POLL_RATE_HZ: f64 = 5.0;
pub const MAX_POLL_RATE_HZ: f64 = 30.0;

/// Gain index to dB-equivalent amplification.
pub const GAIN_TABLE: [(u8, f64); 7] = [
    (0, 0.6),
    (1, 1.8),
    (2, 5.5),
    (3, 12.9),
    (4, 30.2),
    (5, 66.1),
    (6, 144.0),
];

#[cfg(windows)]
pub const DEFAULT_SERIAL_PORT: &str = "COM3";
#[cfg(not(windows))]
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid gain setting {0}: must be one of 0..=6")]
    InvalidGain(u8),

    #[error("Invalid minimum confidence {0}: must be within 0..=100")]
    InvalidConfidence(u8),

    #[error("Invalid distance window: min {min} m, max {max} m")]
    InvalidDistance { min: f64, max: f64 },

    #[error("Unsupported device type '{0}'")]
    UnsupportedDevice(String),

    #[error("Invalid UDP address '{0}': expected host:port")]
    InvalidUdpAddress(String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// dB-equivalent amplification of a gain index, `None` if the index is not in the table.
pub fn gain_db(index: u8) -> Option<f64> {
    GAIN_TABLE
        .iter()
        .find(|(i, _)| *i == index)
        .map(|(_, db)| *db)
}

pub fn clamp_poll_rate(poll_rate_hz: f64) -> f64 {
    if !(poll_rate_hz > MIN_POLL_RATE_HZ) {
        MIN_POLL_RATE_HZ
    } else if poll_rate_hz >= MAX_POLL_RATE_HZ {
        MAX_POLL_RATE_HZ
    } else {
        poll_rate_hz
    }
}

pub fn parse_udp_address(address: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidUdpAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Ping1D,
}

impl std::str::FromStr for DeviceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ping1D" => Ok(DeviceType::Ping1D),
            other => Err(ConfigError::UnsupportedDevice(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAddress {
    Serial { path: String, baudrate: u32 },
    Udp { host: String, port: u16 },
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceAddress::Serial { path, baudrate } => write!(f, "{} @ {} baud", path, baudrate),
            DeviceAddress::Udp { host, port } => write!(f, "udp://{}:{}", host, port),
        }
    }
}

/// User-facing settings, as given on the command line or in a JSON file.
/// Distances in meters, speed of sound in m/s, field of view in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SonarSettings {
    pub baudrate: u32,
    pub port: String,
    pub udp_address: Option<String>,
    pub device_type: String,
    pub poll_rate: f64,
    pub min_distance: f64,
    pub max_distance: f64,
    pub speed_of_sound: f64,
    pub min_confidence: u8,
    pub gain: u8,
    pub ping_interval: u16,
    pub mode_auto: bool,
    pub fov: f64,
    pub csv_path: String,
}

impl Default for SonarSettings {
    fn default() -> Self {
        Self {
            baudrate: 115_200,
            port: DEFAULT_SERIAL_PORT.to_string(),
            udp_address: None,
            device_type: "Ping1D".to_string(),
            poll_rate: 10.0,
            min_distance: 0.0,
            max_distance: 15953.0 * MM_TO_M,
            speed_of_sound: 343.0, // air; ~1481 in water
            min_confidence: 0,
            gain: 6,
            ping_interval: 250,
            mode_auto: true,
            fov: 30.0,
            csv_path: String::new(),
        }
    }
}

impl SonarSettings {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Validated device configuration with the derived device-side quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub address: DeviceAddress,
    pub device_type: DeviceType,
    pub poll_rate_hz: f64,
    pub min_distance_m: f64,
    pub max_distance_m: f64,
    pub scan_start_mm: f64,
    pub scan_range_mm: f64,
    pub speed_of_sound_m_s: f64,
    pub speed_of_sound_mm_s: f64,
    pub min_confidence: u8,
    pub gain: u8,
    pub ping_interval_ms: u16,
    pub mode_auto: bool,
    pub fov_rad: f64,
    pub csv_path: Option<PathBuf>,
}

impl DeviceConfig {
    pub fn new(settings: SonarSettings) -> Result<Self, ConfigError> {
        let device_type = settings.device_type.parse::<DeviceType>()?;

        if gain_db(settings.gain).is_none() {
            return Err(ConfigError::InvalidGain(settings.gain));
        }
        if settings.min_confidence > 100 {
            return Err(ConfigError::InvalidConfidence(settings.min_confidence));
        }
        if !(settings.min_distance >= 0.0) || !(settings.max_distance > settings.min_distance) {
            return Err(ConfigError::InvalidDistance {
                min: settings.min_distance,
                max: settings.max_distance,
            });
        }

        // A network address wins over the serial port.
        let address = match settings.udp_address.as_deref() {
            Some(udp) => {
                let (host, port) = parse_udp_address(udp)?;
                DeviceAddress::Udp { host, port }
            }
            None => DeviceAddress::Serial {
                path: settings.port,
                baudrate: settings.baudrate,
            },
        };

        let scan_start_mm = settings.min_distance * MM_PER_M;
        let scan_range_mm = settings.max_distance * MM_PER_M - scan_start_mm;
        let csv_path = if settings.csv_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(settings.csv_path))
        };

        Ok(DeviceConfig {
            address,
            device_type,
            poll_rate_hz: clamp_poll_rate(settings.poll_rate),
            min_distance_m: settings.min_distance,
            max_distance_m: settings.max_distance,
            scan_start_mm,
            scan_range_mm,
            speed_of_sound_m_s: settings.speed_of_sound,
            speed_of_sound_mm_s: settings.speed_of_sound * MM_PER_M,
            min_confidence: settings.min_confidence,
            gain: settings.gain,
            ping_interval_ms: settings.ping_interval,
            mode_auto: settings.mode_auto,
            fov_rad: settings.fov.to_radians(),
            csv_path,
        })
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.poll_rate_hz)
    }
}

#[derive(Parser, Debug, Default)]
#[command(about = "Polls a Ping1D sonar and logs its range measurements to CSV")]
pub struct Cli {
    /// JSON file with settings; flags given here override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub baudrate: Option<u32>,

    /// Serial port of the device
    #[arg(long)]
    pub port: Option<String>,

    /// Network address of the device as host:port; takes precedence over --port
    #[arg(long)]
    pub udp: Option<String>,

    #[arg(long)]
    pub device_type: Option<String>,

    /// Poll rate in Hz, clamped to [5, 30]
    #[arg(long)]
    pub poll_rate: Option<f64>,

    /// Start of the scan window in meters
    #[arg(long)]
    pub min_distance: Option<f64>,

    /// End of the scan window in meters
    #[arg(long)]
    pub max_distance: Option<f64>,

    /// Speed of sound in m/s
    #[arg(long)]
    pub speed_of_sound: Option<f64>,

    /// Samples below this confidence (0-100) are not logged
    #[arg(long)]
    pub min_confidence: Option<u8>,

    /// Gain index 0-6
    #[arg(long)]
    pub gain: Option<u8>,

    /// Ping interval in ms
    #[arg(long)]
    pub ping_interval: Option<u16>,

    /// Manual mode: gain and range stay as configured instead of being adjusted by the device
    #[arg(long)]
    pub manual: bool,

    /// Field of view in degrees
    #[arg(long)]
    pub fov: Option<f64>,

    /// CSV output path; empty disables logging
    #[arg(long)]
    pub csv: Option<String>,
}

impl Cli {
    pub fn into_settings(self) -> Result<SonarSettings, ConfigError> {
        let mut s = match &self.config {
            Some(path) => SonarSettings::load(path)?,
            None => SonarSettings::default(),
        };

        if let Some(v) = self.baudrate {
            s.baudrate = v;
        }
        if let Some(v) = self.port {
            s.port = v;
        }
        if let Some(v) = self.udp {
            s.udp_address = Some(v);
        }
        if let Some(v) = self.device_type {
            s.device_type = v;
        }
        if let Some(v) = self.poll_rate {
            s.poll_rate = v;
        }
        if let Some(v) = self.min_distance {
            s.min_distance = v;
        }
        if let Some(v) = self.max_distance {
            s.max_distance = v;
        }
        if let Some(v) = self.speed_of_sound {
            s.speed_of_sound = v;
        }
        if let Some(v) = self.min_confidence {
            s.min_confidence = v;
        }
        if let Some(v) = self.gain {
            s.gain = v;
        }
        if let Some(v) = self.ping_interval {
            s.ping_interval = v;
        }
        if self.manual {
            s.mode_auto = false;
        }
        if let Some(v) = self.fov {
            s.fov = v;
        }
        if let Some(v) = self.csv {
            s.csv_path = v;
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn poll_rate_is_clamped() {
        assert_eq!(clamp_poll_rate(0.0), 5.0);
        assert_eq!(clamp_poll_rate(5.0), 5.0);
        assert_eq!(clamp_poll_rate(-3.0), 5.0);
        assert_eq!(clamp_poll_rate(5.5), 5.5);
        assert_eq!(clamp_poll_rate(29.9), 29.9);
        assert_eq!(clamp_poll_rate(30.0), 30.0);
        assert_eq!(clamp_poll_rate(120.0), 30.0);
        assert_eq!(clamp_poll_rate(f64::NAN), 5.0);
    }

    #[test]
    fn gain_table_covers_exactly_zero_to_six() {
        for index in 0..=6 {
            assert!(gain_db(index).is_some());
        }
        assert_eq!(gain_db(3), Some(12.9));
        assert_eq!(gain_db(7), None);
        assert_eq!(gain_db(255), None);
    }

    #[test]
    fn invalid_gain_is_rejected() {
        for gain in [7u8, 10, 200] {
            let settings = SonarSettings {
                gain,
                ..Default::default()
            };
            assert!(matches!(
                DeviceConfig::new(settings),
                Err(ConfigError::InvalidGain(g)) if g == gain
            ));
        }
    }

    #[test]
    fn derives_scan_window_and_speed() {
        let settings = SonarSettings {
            min_distance: 0.5,
            max_distance: 10.0,
            speed_of_sound: 1481.0,
            fov: 180.0,
            poll_rate: 50.0,
            ..Default::default()
        };
        let cfg = DeviceConfig::new(settings).unwrap();
        assert_eq!(cfg.scan_start_mm, 500.0);
        assert_eq!(cfg.scan_range_mm, 9500.0);
        assert_eq!(cfg.speed_of_sound_mm_s, 1_481_000.0);
        assert_eq!(cfg.poll_rate_hz, 30.0);
        assert!((cfg.fov_rad - std::f64::consts::PI).abs() < 1e-12);
        assert!(cfg.csv_path.is_none());
    }

    #[test]
    fn udp_address_takes_precedence() {
        let settings = SonarSettings {
            udp_address: Some("192.168.2.2:9090".to_string()),
            ..Default::default()
        };
        let cfg = DeviceConfig::new(settings).unwrap();
        assert_eq!(
            cfg.address,
            DeviceAddress::Udp {
                host: "192.168.2.2".to_string(),
                port: 9090
            }
        );
    }

    #[test]
    fn malformed_udp_address_is_rejected() {
        assert!(parse_udp_address("192.168.2.2").is_err());
        assert!(parse_udp_address(":9090").is_err());
        assert!(parse_udp_address("host:notaport").is_err());
        assert_eq!(
            parse_udp_address("localhost:9090").unwrap(),
            ("localhost".to_string(), 9090)
        );
    }

    #[test]
    fn other_validation_errors() {
        let bad_device = SonarSettings {
            device_type: "Ping360".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            DeviceConfig::new(bad_device),
            Err(ConfigError::UnsupportedDevice(_))
        ));

        let bad_confidence = SonarSettings {
            min_confidence: 101,
            ..Default::default()
        };
        assert!(matches!(
            DeviceConfig::new(bad_confidence),
            Err(ConfigError::InvalidConfidence(101))
        ));

        let bad_window = SonarSettings {
            min_distance: 5.0,
            max_distance: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            DeviceConfig::new(bad_window),
            Err(ConfigError::InvalidDistance { .. })
        ));
    }

    #[test]
    fn cli_flags_override_config_file() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(br#"{"gain": 3, "poll_rate": 20.0, "csv_path": "out.csv"}"#)
            .unwrap();
        let path = temp.into_temp_path();

        let cli = Cli::parse_from([
            "ping-sonar-logger",
            "--config",
            path.to_str().unwrap(),
            "--gain",
            "4",
        ]);
        let settings = cli.into_settings().unwrap();
        assert_eq!(settings.gain, 4);
        assert_eq!(settings.poll_rate, 20.0);
        assert_eq!(settings.csv_path, "out.csv");
        assert_eq!(settings.baudrate, 115_200);
    }

    #[test]
    fn manual_flag_turns_auto_mode_off() {
        let settings = Cli::parse_from(["ping-sonar-logger"]).into_settings().unwrap();
        assert!(settings.mode_auto);

        let settings = Cli::parse_from(["ping-sonar-logger", "--manual"])
            .into_settings()
            .unwrap();
        assert!(!settings.mode_auto);
    }

    #[test]
    fn file_auto_mode_survives_without_manual_flag() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(br#"{"mode_auto": false}"#).unwrap();
        let path = temp.into_temp_path();
        let cli = Cli::parse_from(["ping-sonar-logger", "--config", path.to_str().unwrap()]);
        assert!(!cli.into_settings().unwrap().mode_auto);
    }

    #[test]
    fn unreadable_config_file_is_an_error() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/sonar.json")),
            ..Default::default()
        };
        assert!(matches!(cli.into_settings(), Err(ConfigError::Read { .. })));
    }
}
