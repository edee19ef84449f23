//! Framing for the Ping protocol spoken by Ping1D echosounders.
//!
//! Every frame is `'B' 'R'`, payload length (u16), message id (u16), source
//! and destination device ids (u8 each), the payload, then a u16 checksum
//! holding the wrapping sum of all preceding bytes. Multi-byte fields are
//! little-endian.

use super::{
    GeneralInfoResponse, PingError, ProfileResponse, RangeResponse, Result, SpeedOfSoundResponse,
};

pub const START_1: u8 = b'B';
pub const START_2: u8 = b'R';
pub const HEADER_LEN: usize = 8;
pub const CHECKSUM_LEN: usize = 2;

/// Largest payload accepted before the decoder assumes it lost sync.
pub const MAX_PAYLOAD_LEN: usize = 4096;

pub mod ids {
    pub const ACK: u16 = 1;
    pub const NACK: u16 = 2;
    pub const PROTOCOL_VERSION: u16 = 5;
    pub const GENERAL_REQUEST: u16 = 6;

    pub const SET_RANGE: u16 = 1001;
    pub const SET_SPEED_OF_SOUND: u16 = 1002;
    pub const SET_MODE_AUTO: u16 = 1003;
    pub const SET_PING_INTERVAL: u16 = 1004;
    pub const SET_GAIN_SETTING: u16 = 1005;

    pub const SPEED_OF_SOUND: u16 = 1203;
    pub const RANGE: u16 = 1204;
    pub const GENERAL_INFO: u16 = 1210;
    pub const PROFILE: u16 = 1300;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub src_device_id: u8,
    pub dst_device_id: u8,
    pub payload: Vec<u8>,
}

pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

impl Message {
    pub fn new(id: u16, payload: Vec<u8>) -> Self {
        Message {
            id,
            src_device_id: 0,
            dst_device_id: 0,
            payload,
        }
    }

    pub fn general_request(requested_id: u16) -> Self {
        Self::new(ids::GENERAL_REQUEST, requested_id.to_le_bytes().to_vec())
    }

    pub fn set_speed_of_sound(speed_of_sound_mm_s: u32) -> Self {
        Self::new(
            ids::SET_SPEED_OF_SOUND,
            speed_of_sound_mm_s.to_le_bytes().to_vec(),
        )
    }

    pub fn set_range(scan_start_mm: u32, scan_length_mm: u32) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&scan_start_mm.to_le_bytes());
        payload.extend_from_slice(&scan_length_mm.to_le_bytes());
        Self::new(ids::SET_RANGE, payload)
    }

    pub fn set_ping_interval(ping_interval_ms: u16) -> Self {
        Self::new(
            ids::SET_PING_INTERVAL,
            ping_interval_ms.to_le_bytes().to_vec(),
        )
    }

    pub fn set_gain_setting(gain_setting: u8) -> Self {
        Self::new(ids::SET_GAIN_SETTING, vec![gain_setting])
    }

    pub fn set_mode_auto(mode_auto: u8) -> Self {
        Self::new(ids::SET_MODE_AUTO, vec![mode_auto])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        frame.push(START_1);
        frame.push(START_2);
        frame.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&self.id.to_le_bytes());
        frame.push(self.src_device_id);
        frame.push(self.dst_device_id);
        frame.extend_from_slice(&self.payload);
        let sum = checksum(&frame);
        frame.extend_from_slice(&sum.to_le_bytes());
        frame
    }
}

/// Reassembles frames from a byte stream that may arrive in arbitrary chunks.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete frame, `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Option<Result<Message>> {
        loop {
            // Drop garbage up to the next start sequence.
            match self.buf.windows(2).position(|w| w == [START_1, START_2]) {
                Some(start) => {
                    self.buf.drain(..start);
                }
                None => {
                    let keep = usize::from(self.buf.last() == Some(&START_1));
                    let len = self.buf.len();
                    self.buf.drain(..len - keep);
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let payload_len = usize::from(u16::from_le_bytes([self.buf[2], self.buf[3]]));
            let id = u16::from_le_bytes([self.buf[4], self.buf[5]]);
            if payload_len > MAX_PAYLOAD_LEN {
                // Not a real header; resync past this start byte.
                self.buf.drain(..1);
                return Some(Err(PingError::Malformed {
                    id,
                    reason: format!("payload length {} exceeds {}", payload_len, MAX_PAYLOAD_LEN),
                }));
            }

            let frame_len = HEADER_LEN + payload_len + CHECKSUM_LEN;
            if self.buf.len() < frame_len {
                return None;
            }

            let frame: Vec<u8> = self.buf.drain(..frame_len).collect();
            let body_len = frame_len - CHECKSUM_LEN;
            let expected = checksum(&frame[..body_len]);
            let actual = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
            if expected != actual {
                return Some(Err(PingError::Checksum { expected, actual }));
            }

            return Some(Ok(Message {
                id,
                src_device_id: frame[6],
                dst_device_id: frame[7],
                payload: frame[HEADER_LEN..body_len].to_vec(),
            }));
        }
    }
}

struct PayloadReader<'a> {
    id: u16,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(message: &'a Message) -> Self {
        PayloadReader {
            id: message.id,
            bytes: &message.payload,
            pos: 0,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(PingError::Malformed {
                id: self.id,
                reason: format!(
                    "payload too short: need {} bytes, have {}",
                    end,
                    self.bytes.len()
                ),
            });
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        out
    }
}

fn expect_id(message: &Message, id: u16) -> Result<()> {
    if message.id != id {
        return Err(PingError::Malformed {
            id: message.id,
            reason: format!("expected message {}", id),
        });
    }
    Ok(())
}

/// Decodes a NACK into the rejected message id and the device's reason.
pub fn decode_nack(message: &Message) -> Result<(u16, String)> {
    expect_id(message, ids::NACK)?;
    let mut r = PayloadReader::new(message);
    let nacked_id = r.u16()?;
    let text = r.rest();
    let text = text.split(|&b| b == 0).next().unwrap_or_default();
    Ok((nacked_id, String::from_utf8_lossy(text).into_owned()))
}

impl ProfileResponse {
    pub fn decode(message: &Message) -> Result<Self> {
        expect_id(message, ids::PROFILE)?;
        let mut r = PayloadReader::new(message);
        let distance = r.u32()?;
        let confidence = r.u16()?;
        let transmit_duration = r.u16()?;
        let ping_number = r.u32()?;
        let scan_start = r.u32()?;
        let scan_length = r.u32()?;
        let gain_setting = r.u32()?;
        let data_len = usize::from(r.u16()?);
        let profile_data = r.take(data_len)?.to_vec();
        Ok(ProfileResponse {
            distance,
            confidence,
            transmit_duration,
            ping_number,
            scan_start,
            scan_length,
            gain_setting,
            profile_data,
        })
    }
}

impl SpeedOfSoundResponse {
    pub fn decode(message: &Message) -> Result<Self> {
        expect_id(message, ids::SPEED_OF_SOUND)?;
        let mut r = PayloadReader::new(message);
        Ok(SpeedOfSoundResponse {
            speed_of_sound: r.u32()?,
        })
    }
}

impl RangeResponse {
    pub fn decode(message: &Message) -> Result<Self> {
        expect_id(message, ids::RANGE)?;
        let mut r = PayloadReader::new(message);
        Ok(RangeResponse {
            scan_start: r.u32()?,
            scan_length: r.u32()?,
        })
    }
}

impl GeneralInfoResponse {
    pub fn decode(message: &Message) -> Result<Self> {
        expect_id(message, ids::GENERAL_INFO)?;
        let mut r = PayloadReader::new(message);
        Ok(GeneralInfoResponse {
            firmware_version_major: r.u16()?,
            firmware_version_minor: r.u16()?,
            voltage_5: r.u16()?,
            ping_interval: r.u16()?,
            gain_setting: r.u8()?,
            mode_auto: r.u8()?,
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn profile_payload(profile: &ProfileResponse) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&profile.distance.to_le_bytes());
        p.extend_from_slice(&profile.confidence.to_le_bytes());
        p.extend_from_slice(&profile.transmit_duration.to_le_bytes());
        p.extend_from_slice(&profile.ping_number.to_le_bytes());
        p.extend_from_slice(&profile.scan_start.to_le_bytes());
        p.extend_from_slice(&profile.scan_length.to_le_bytes());
        p.extend_from_slice(&profile.gain_setting.to_le_bytes());
        p.extend_from_slice(&(profile.profile_data.len() as u16).to_le_bytes());
        p.extend_from_slice(&profile.profile_data);
        p
    }

    pub fn general_info_payload(info: &GeneralInfoResponse) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&info.firmware_version_major.to_le_bytes());
        p.extend_from_slice(&info.firmware_version_minor.to_le_bytes());
        p.extend_from_slice(&info.voltage_5.to_le_bytes());
        p.extend_from_slice(&info.ping_interval.to_le_bytes());
        p.push(info.gain_setting);
        p.push(info.mode_auto);
        p
    }

    #[test]
    fn general_request_has_expected_layout() {
        let frame = Message::general_request(ids::PROFILE).encode();
        // 1300 = 0x0514
        assert_eq!(
            frame,
            vec![0x42, 0x52, 0x02, 0x00, 0x06, 0x00, 0x00, 0x00, 0x14, 0x05, 0xb5, 0x00]
        );
    }

    #[test]
    fn set_range_payload_is_start_then_length() {
        let msg = Message::set_range(500, 15453);
        assert_eq!(msg.id, ids::SET_RANGE);
        assert_eq!(&msg.payload[..4], &500u32.to_le_bytes());
        assert_eq!(&msg.payload[4..], &15453u32.to_le_bytes());
    }

    #[test]
    fn decoder_handles_split_frames_and_leading_garbage() {
        let frame = Message::new(ids::SPEED_OF_SOUND, 343_000u32.to_le_bytes().to_vec()).encode();
        let mut decoder = Decoder::new();
        decoder.push(&[0x00, 0x13, b'B']);
        assert!(decoder.next_message().is_none());
        decoder.push(&frame[..5]);
        assert!(decoder.next_message().is_none());
        decoder.push(&frame[5..]);

        let msg = decoder.next_message().unwrap().unwrap();
        let speed = SpeedOfSoundResponse::decode(&msg).unwrap();
        assert_eq!(speed.speed_of_sound, 343_000);
        assert!(decoder.next_message().is_none());
    }

    #[test]
    fn decoder_reports_bad_checksum_and_recovers() {
        let mut bad = Message::new(ids::ACK, vec![0xe9, 0x03]).encode();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        let good = Message::new(ids::ACK, vec![0xea, 0x03]).encode();

        let mut decoder = Decoder::new();
        decoder.push(&bad);
        decoder.push(&good);
        assert!(matches!(
            decoder.next_message(),
            Some(Err(PingError::Checksum { .. }))
        ));
        let msg = decoder.next_message().unwrap().unwrap();
        assert_eq!(msg.payload, vec![0xea, 0x03]);
    }

    #[test]
    fn profile_decodes_all_fields() {
        let profile = ProfileResponse {
            distance: 1532,
            confidence: 87,
            transmit_duration: 120,
            ping_number: 4021,
            scan_start: 0,
            scan_length: 5000,
            gain_setting: 3,
            profile_data: vec![0, 12, 255, 40],
        };
        let msg = Message::new(ids::PROFILE, profile_payload(&profile));
        assert_eq!(ProfileResponse::decode(&msg).unwrap(), profile);
    }

    #[test]
    fn truncated_profile_is_malformed() {
        let msg = Message::new(ids::PROFILE, vec![1, 2, 3]);
        assert!(matches!(
            ProfileResponse::decode(&msg),
            Err(PingError::Malformed { id: ids::PROFILE, .. })
        ));
    }

    #[test]
    fn nack_carries_rejected_id_and_reason() {
        let mut payload = ids::SET_GAIN_SETTING.to_le_bytes().to_vec();
        payload.extend_from_slice(b"out of range\0");
        let (id, reason) = decode_nack(&Message::new(ids::NACK, payload)).unwrap();
        assert_eq!(id, ids::SET_GAIN_SETTING);
        assert_eq!(reason, "out of range");
    }
}
