pub mod data;

use crate::config::{ConfigError, DeviceAddress, DeviceConfig, gain_db};
use crate::devices::{PingDevice, PingError, Ping1D};
use chrono::Utc;
use data::{CsvSink, Measurement};
use std::fs::File;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not initialize {0}")]
    InitializationFailed(String),

    #[error("Device error: {0}")]
    Device(#[from] PingError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Confidence met the threshold; written to the sink if one is open.
    Accepted(Measurement),
    /// Confidence below the threshold; dropped.
    Rejected(Measurement),
    /// The device returned no profile.
    NoData,
}

/// Opens the transport named by the configuration.
pub fn connect(config: &DeviceConfig) -> Result<Ping1D, AcquisitionError> {
    info!("Connecting to {:?} at {}", config.device_type, config.address);
    let device = match &config.address {
        DeviceAddress::Udp { host, port } => Ping1D::connect_udp(host, *port)?,
        DeviceAddress::Serial { path, baudrate } => Ping1D::connect_serial(path, *baudrate)?,
    };
    Ok(device)
}

/// Initializes the device and pushes the operating parameters.
///
/// An unknown gain index or a failed initialization is fatal and happens
/// before any configuration write. Individual writes that the device does not
/// confirm are logged and skipped.
pub fn configure_device<D: PingDevice + ?Sized>(
    device: &mut D,
    config: &DeviceConfig,
) -> Result<(), AcquisitionError> {
    let gain_level_db = gain_db(config.gain).ok_or(ConfigError::InvalidGain(config.gain))?;

    if !device.initialize() {
        error!("Device at {} did not initialize", config.address);
        return Err(AcquisitionError::InitializationFailed(format!(
            "{:?} at {}",
            config.device_type, config.address
        )));
    }

    // Speed of sound is truncated; the scan window is rounded to the nearest millimeter.
    let speed_mm_s = config.speed_of_sound_mm_s as u32;
    let scan_start_mm = config.scan_start_mm.round() as u32;
    let scan_range_mm = config.scan_range_mm.round() as u32;
    info!(
        "Configuring device: speed of sound {} mm/s, range {}+{} mm, ping interval {} ms, gain {} ({} dB), auto {}",
        speed_mm_s,
        scan_start_mm,
        scan_range_mm,
        config.ping_interval_ms,
        config.gain,
        gain_level_db,
        config.mode_auto
    );

    if let Err(e) = device.set_speed_of_sound(speed_mm_s) {
        warn!("Failed to set speed of sound: {}", e);
    }
    if let Err(e) = device.set_range(scan_start_mm, scan_range_mm) {
        warn!("Failed to set range: {}", e);
    }
    if let Err(e) = device.set_ping_interval(config.ping_interval_ms) {
        warn!("Failed to set ping interval: {}", e);
    }
    if let Err(e) = device.set_gain_setting(config.gain) {
        warn!("Failed to set gain setting: {}", e);
    }
    if let Err(e) = device.set_mode_auto(u8::from(config.mode_auto)) {
        warn!("Failed to set auto mode: {}", e);
    }

    Ok(())
}

/// Owns the configured device and the optional CSV sink for the lifetime of the poll loop.
pub struct SonarLogger<D: PingDevice> {
    device: D,
    config: DeviceConfig,
    sink: Option<CsvSink<File>>,
}

impl<D: PingDevice> SonarLogger<D> {
    /// Configures `device`, then opens the CSV sink if an output path was given.
    pub fn new(mut device: D, config: DeviceConfig) -> Result<Self, AcquisitionError> {
        configure_device(&mut device, &config)?;

        info!(
            "Scan window {}-{} m, field of view {:.3} rad",
            config.min_distance_m, config.max_distance_m, config.fov_rad
        );
        if let Some(info) = device.get_general_info() {
            info!(
                "Device firmware {}.{}, supply {} mV, ping interval {} ms, gain {}, auto {}",
                info.firmware_version_major,
                info.firmware_version_minor,
                info.voltage_5,
                info.ping_interval,
                info.gain_setting,
                info.mode_auto
            );
        }

        let sink = match &config.csv_path {
            Some(path) => Some(CsvSink::create(path)?),
            None => {
                info!("No CSV path given, measurements will not be logged");
                None
            }
        };

        Ok(SonarLogger {
            device,
            config,
            sink,
        })
    }

    #[cfg(test)]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Whether accepted samples go to a CSV file.
    pub fn is_logging(&self) -> bool {
        self.sink.is_some()
    }

    pub fn rows_written(&self) -> u64 {
        self.sink.as_ref().map_or(0, CsvSink::rows_written)
    }

    /// Runs one acquisition cycle without sleeping.
    pub fn poll_once(&mut self) -> Result<CycleOutcome, AcquisitionError> {
        let timestamp = Utc::now();

        let profile = self.device.get_profile();
        if profile.is_none() {
            println!("Failed to get data");
            warn!("No profile data this cycle");
        }

        // Queried independently of the profile; values may be from a different ping.
        let speed = self.device.get_speed_of_sound();
        if speed.is_none() {
            warn!("No speed of sound this cycle");
        }
        let general_info = self.device.get_general_info();
        if general_info.is_none() {
            warn!("No general info this cycle");
        }

        let Some(profile) = profile else {
            return Ok(CycleOutcome::NoData);
        };

        let measurement =
            Measurement::from_responses(timestamp, profile, speed.as_ref(), general_info.as_ref());
        println!(
            "Distance: {} meters, Confidence: {}, Transmit Duration: {}",
            measurement.distance_m, measurement.confidence, measurement.transmit_duration_us
        );

        if measurement.confidence < u16::from(self.config.min_confidence) {
            debug!(
                "Dropping ping {}: confidence {} below {}",
                measurement.ping_number, measurement.confidence, self.config.min_confidence
            );
            return Ok(CycleOutcome::Rejected(measurement));
        }

        if let Some(sink) = &mut self.sink {
            sink.write(&measurement)?;
        }
        Ok(CycleOutcome::Accepted(measurement))
    }

    /// One cycle followed by the rate-limiting sleep.
    pub fn range_callback(&mut self) -> Result<CycleOutcome, AcquisitionError> {
        let outcome = self.poll_once()?;
        std::thread::sleep(self.config.poll_interval());
        Ok(outcome)
    }

    /// Polls until the process is killed or the sink fails.
    pub fn run(&mut self) -> Result<(), AcquisitionError> {
        info!(
            "Polling at {} Hz, CSV logging {}",
            self.config.poll_rate_hz,
            if self.is_logging() { "on" } else { "off" }
        );
        loop {
            self.range_callback()?;
        }
    }

    /// Velocity from successive distances. Not available; always returns
    /// [`AcquisitionError::NotImplemented`] so a missing value is never read as zero.
    pub fn differentiate_distance(
        &self,
        _distance_delta: f64,
        _dt: f64,
    ) -> Result<f64, AcquisitionError> {
        Err(AcquisitionError::NotImplemented("differentiate_distance"))
    }
}
