//! ChannelData framing (RFC 5766 §11.4).
//!
//! A bound channel replaces the 36-byte Send/Data indication overhead with a
//! 4-byte header: channel number and payload length.

use crate::stun::StunError;

use super::{FIRST_CHANNEL, LAST_CHANNEL};

const HEADER_LEN: usize = 4;

/// One ChannelData frame, borrowing its payload from the datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct ChannelData<'a> {
    number: u16,
    payload: &'a [u8],
}

impl<'a> ChannelData<'a> {
    pub fn new(number: u16, payload: &'a [u8]) -> Self {
        debug_assert!((FIRST_CHANNEL..=LAST_CHANNEL).contains(&number));
        ChannelData { number, payload }
    }

    /// Decodes one frame. The payload length comes from the header; trailing
    /// bytes past it (padding over some transports) are ignored.
    pub fn parse(packet: &'a [u8]) -> Result<Self, StunError> {
        if packet.len() < HEADER_LEN {
            return Err(StunError::UnexpectedEof);
        }

        // A number outside the channel range means this is not ChannelData
        // framing at all.
        let number = u16::from_be_bytes([packet[0], packet[1]]);
        if !(FIRST_CHANNEL..=LAST_CHANNEL).contains(&number) {
            return Err(StunError::NotStun);
        }

        let length = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        let payload = packet
            .get(HEADER_LEN..HEADER_LEN + length)
            .ok_or(StunError::UnexpectedEof)?;

        Ok(ChannelData { number, payload })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_LEN + self.payload.len());
        frame.extend_from_slice(&self.number.to_be_bytes());
        frame.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(self.payload);
        frame
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest::proptest! {
        #[test]
        fn encoding_roundtrip(
            number in FIRST_CHANNEL..=LAST_CHANNEL,
            payload in proptest::collection::vec(any::<u8>(), 0..1024),
        ) {
            let frame = ChannelData::new(number, &payload).to_bytes();
            let parsed = ChannelData::parse(&frame).unwrap();

            prop_assert_eq!(parsed.number(), number);
            prop_assert_eq!(parsed.payload(), payload.as_slice());
        }
    }

    #[test]
    fn number_outside_channel_range_is_rejected() {
        assert_eq!(
            ChannelData::parse(&[0x3f, 0xff, 0x00, 0x00]),
            Err(StunError::NotStun)
        );
    }

    #[test]
    fn header_length_beyond_packet_is_rejected() {
        assert_eq!(
            ChannelData::parse(&[0x40, 0x00, 0x00, 0x10, 0xaa]),
            Err(StunError::UnexpectedEof)
        );
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let parsed =
            ChannelData::parse(&[0x40, 0x01, 0x00, 0x02, 0xaa, 0xbb, 0x00, 0x00]).unwrap();

        assert_eq!(parsed.number(), 0x4001);
        assert_eq!(parsed.payload(), [0xaa, 0xbb].as_slice());
    }
}
