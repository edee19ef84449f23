use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::protocol::{Decoder, Message, decode_nack, ids};
use super::transport::{SerialTransport, Transport, UdpTransport};
use super::{
    GeneralInfoResponse, PingDevice, PingError, ProfileResponse, RangeResponse, Result,
    SpeedOfSoundResponse,
};

/// How long a request waits for its reply.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Ping1D {
    transport: Box<dyn Transport>,
    decoder: Decoder,
}

impl Ping1D {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        info!("Initializing Ping1D on {}", transport.describe());
        Ping1D {
            transport,
            decoder: Decoder::new(),
        }
    }

    pub fn connect_serial(path: &str, baudrate: u32) -> Result<Self> {
        let transport = SerialTransport::open(path, baudrate)?;
        Ok(Self::new(Box::new(transport)))
    }

    pub fn connect_udp(host: &str, port: u16) -> Result<Self> {
        let transport = UdpTransport::connect(host, port)?;
        Ok(Self::new(Box::new(transport)))
    }

    pub fn send_message(&mut self, message: &Message) -> Result<()> {
        debug!("Sending message {} ({} byte payload)", message.id, message.payload.len());
        self.transport.send(&message.encode())?;
        Ok(())
    }

    /// Asks the device for message `id` and waits for it.
    pub fn request(&mut self, id: u16) -> Result<Message> {
        // Anything still buffered belongs to an earlier, abandoned request.
        self.decoder.clear();
        self.send_message(&Message::general_request(id))?;
        self.wait_for(id, Instant::now() + REQUEST_TIMEOUT)
    }

    fn wait_for(&mut self, id: u16, deadline: Instant) -> Result<Message> {
        let mut buf = [0u8; 1024];
        loop {
            while let Some(item) = self.decoder.next_message() {
                match item {
                    Ok(msg) if msg.id == id => {
                        debug!("Received message {}", id);
                        return Ok(msg);
                    }
                    Ok(msg) if msg.id == ids::ACK => {
                        debug!("Device acknowledged message {:?}", msg.payload);
                    }
                    Ok(msg) if msg.id == ids::NACK => {
                        let (nacked_id, reason) = decode_nack(&msg)?;
                        if nacked_id == id {
                            return Err(PingError::Nack { id, reason });
                        }
                        debug!("Ignoring NACK for message {}: {}", nacked_id, reason);
                    }
                    Ok(msg) => debug!("Skipping unsolicited message {}", msg.id),
                    Err(e) => warn!("Discarding corrupt frame: {}", e),
                }
            }

            if Instant::now() >= deadline {
                return Err(PingError::Timeout(id));
            }

            let n = self.transport.recv(&mut buf)?;
            if n > 0 {
                self.decoder.push(&buf[..n]);
            }
        }
    }

    fn query<T>(&mut self, id: u16, decode: fn(&Message) -> Result<T>) -> Result<T> {
        let msg = self.request(id)?;
        decode(&msg)
    }

    pub fn get_range(&mut self) -> Result<RangeResponse> {
        self.query(ids::RANGE, RangeResponse::decode)
    }

    fn try_get<T>(&mut self, what: &str, id: u16, decode: fn(&Message) -> Result<T>) -> Option<T> {
        match self.query(id, decode) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to get {}: {}", what, e);
                None
            }
        }
    }
}

fn verify(field: &'static str, expected: u32, actual: u32) -> Result<()> {
    if expected != actual {
        return Err(PingError::VerifyMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

impl PingDevice for Ping1D {
    fn initialize(&mut self) -> bool {
        match self.request(ids::PROTOCOL_VERSION) {
            Ok(_) => {
                info!("Ping1D answered protocol version request");
                true
            }
            Err(e) => {
                warn!("Ping1D did not answer protocol version request: {}", e);
                false
            }
        }
    }

    fn set_speed_of_sound(&mut self, speed_of_sound_mm_s: u32) -> Result<()> {
        info!("Setting speed of sound to {} mm/s", speed_of_sound_mm_s);
        self.send_message(&Message::set_speed_of_sound(speed_of_sound_mm_s))?;
        let read = self.query(ids::SPEED_OF_SOUND, SpeedOfSoundResponse::decode)?;
        verify("speed_of_sound", speed_of_sound_mm_s, read.speed_of_sound)
    }

    fn set_range(&mut self, scan_start_mm: u32, scan_length_mm: u32) -> Result<()> {
        info!("Setting range to start {} mm, length {} mm", scan_start_mm, scan_length_mm);
        self.send_message(&Message::set_range(scan_start_mm, scan_length_mm))?;
        let read = self.get_range()?;
        verify("scan_start", scan_start_mm, read.scan_start)?;
        verify("scan_length", scan_length_mm, read.scan_length)
    }

    fn set_ping_interval(&mut self, ping_interval_ms: u16) -> Result<()> {
        info!("Setting ping interval to {} ms", ping_interval_ms);
        self.send_message(&Message::set_ping_interval(ping_interval_ms))?;
        let read = self.query(ids::GENERAL_INFO, GeneralInfoResponse::decode)?;
        verify(
            "ping_interval",
            u32::from(ping_interval_ms),
            u32::from(read.ping_interval),
        )
    }

    fn set_gain_setting(&mut self, gain_setting: u8) -> Result<()> {
        info!("Setting gain index to {}", gain_setting);
        self.send_message(&Message::set_gain_setting(gain_setting))?;
        let read = self.query(ids::GENERAL_INFO, GeneralInfoResponse::decode)?;
        verify(
            "gain_setting",
            u32::from(gain_setting),
            u32::from(read.gain_setting),
        )
    }

    fn set_mode_auto(&mut self, mode_auto: u8) -> Result<()> {
        info!("Setting auto mode to {}", mode_auto);
        self.send_message(&Message::set_mode_auto(mode_auto))?;
        let read = self.query(ids::GENERAL_INFO, GeneralInfoResponse::decode)?;
        verify("mode_auto", u32::from(mode_auto), u32::from(read.mode_auto))
    }

    fn get_profile(&mut self) -> Option<ProfileResponse> {
        self.try_get("profile", ids::PROFILE, ProfileResponse::decode)
    }

    fn get_speed_of_sound(&mut self) -> Option<SpeedOfSoundResponse> {
        self.try_get("speed of sound", ids::SPEED_OF_SOUND, SpeedOfSoundResponse::decode)
    }

    fn get_general_info(&mut self) -> Option<GeneralInfoResponse> {
        self.try_get("general info", ids::GENERAL_INFO, GeneralInfoResponse::decode)
    }
}
