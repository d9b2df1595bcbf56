//! Owned views of the records carried through the region and over the wire.
//!
//! The region and the datagrams use the same fixed little-endian word images (see
//! [`layout`](super::layout)). These types are what the relay, the receiver and the tests
//! work with once a record has been copied out.

use crate::clock::Timestamp;
use crate::data::layout::{self, counter, error, irig, EDGES_PER_PACKET, IRIG_DECADES};
use crate::error::{AppResult, DaqError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One timestamped encoder edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeRecord {
    /// Tick and overflow count at the edge.
    pub clock: Timestamp,
    /// Monotonic edge counter value.
    pub edge_index: u32,
}

/// Quadrature pins latched at the first rising edge of a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuadratureState {
    /// First auxiliary pin.
    pub phase_a: u32,
    /// Second auxiliary pin.
    pub phase_b: u32,
    /// Third auxiliary pin.
    pub phase_c: u32,
}

/// 150 encoder edges and the latched quadrature state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterPacket {
    /// Edges in capture order.
    pub edges: Vec<EdgeRecord>,
    /// Quadrature pins.
    pub quadrature: QuadratureState,
}

/// One decoded IRIG-B frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrigFrame {
    /// Rising edge of the frame reference marker.
    pub rising_edge: Timestamp,
    /// Ten 10-bit data words, bit `n` of word `d` is position `10 * d + n`.
    pub info: [u32; IRIG_DECADES],
    /// Rising edges of the ten position identifiers.
    pub sync_pulses: [Timestamp; IRIG_DECADES],
}

/// Error codes carried by the error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error.
    None,
    /// A position identifier failed to classify as a marker.
    Desync,
    /// A code this build does not know.
    Unknown(u32),
}

impl ErrorCode {
    /// Raw value stored in the record.
    pub const fn raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Desync => 1,
            Self::Unknown(code) => code,
        }
    }

    /// Decode a raw value.
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Desync,
            other => Self::Unknown(other),
        }
    }
}

/// The error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorState {
    /// Latest error code.
    pub code: ErrorCode,
}

/// Any record that can appear in a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Encoder edges.
    Counter(CounterPacket),
    /// IRIG frame.
    Irig(IrigFrame),
    /// Error record.
    Error(ErrorState),
}

impl Packet {
    /// Header word identifying this packet kind.
    pub fn header(&self) -> u32 {
        match self {
            Self::Counter(_) => layout::COUNTER_HEADER,
            Self::Irig(_) => layout::IRIG_HEADER,
            Self::Error(_) => layout::ERROR_HEADER,
        }
    }

    /// Decode a record from its word image, header first.
    pub fn from_words(words: &[u32]) -> AppResult<Self> {
        let header = *words
            .first()
            .ok_or_else(|| DaqError::Packet("empty record".into()))?;
        let expected = match header {
            layout::COUNTER_HEADER => counter::WORDS,
            layout::IRIG_HEADER => irig::WORDS,
            layout::ERROR_HEADER => error::WORDS,
            other => return Err(DaqError::Packet(format!("unknown header {other:#06x}"))),
        };
        if words.len() != expected {
            return Err(DaqError::Packet(format!(
                "header {header:#06x} expects {} bytes, got {}",
                expected * 4,
                words.len() * 4
            )));
        }

        Ok(match header {
            layout::COUNTER_HEADER => Self::Counter(decode_counter(words)),
            layout::IRIG_HEADER => Self::Irig(decode_irig(words)),
            _ => Self::Error(ErrorState {
                code: ErrorCode::from_raw(words[error::CODE]),
            }),
        })
    }

    /// Decode a datagram.
    pub fn decode(datagram: &[u8]) -> AppResult<Self> {
        if datagram.len() % 4 != 0 {
            return Err(DaqError::Packet(format!(
                "datagram of {} bytes is not word aligned",
                datagram.len()
            )));
        }
        let mut buf = datagram;
        let mut words = Vec::with_capacity(datagram.len() / 4);
        while buf.has_remaining() {
            words.push(buf.get_u32_le());
        }
        Self::from_words(&words)
    }

    /// Word image of this packet, header first.
    pub fn to_words(&self) -> Vec<u32> {
        match self {
            Self::Counter(p) => {
                let mut words = vec![0u32; counter::WORDS];
                words[counter::HEADER] = layout::COUNTER_HEADER;
                for (i, edge) in p.edges.iter().take(EDGES_PER_PACKET).enumerate() {
                    words[counter::CLOCK + i] = edge.clock.tick;
                    words[counter::OVERFLOW + i] = edge.clock.overflows;
                    words[counter::EDGE_INDEX + i] = edge.edge_index;
                }
                words[counter::QUADRATURE] = p.quadrature.phase_a;
                words[counter::QUADRATURE + 1] = p.quadrature.phase_b;
                words[counter::QUADRATURE + 2] = p.quadrature.phase_c;
                words
            }
            Self::Irig(f) => {
                let mut words = vec![0u32; irig::WORDS];
                words[irig::HEADER] = layout::IRIG_HEADER;
                words[irig::RISING_EDGE] = f.rising_edge.tick;
                words[irig::INIT_OVERFLOW] = f.rising_edge.overflows;
                for d in 0..IRIG_DECADES {
                    words[irig::INFO + d] = f.info[d];
                    words[irig::SYNC_TIME + d] = f.sync_pulses[d].tick;
                    words[irig::SYNC_OVERFLOW + d] = f.sync_pulses[d].overflows;
                }
                words
            }
            Self::Error(e) => vec![layout::ERROR_HEADER, e.code.raw()],
        }
    }

    /// Datagram image of this packet.
    pub fn encode(&self) -> Bytes {
        let words = self.to_words();
        let mut buf = BytesMut::with_capacity(words.len() * 4);
        for word in words {
            buf.put_u32_le(word);
        }
        buf.freeze()
    }
}

fn decode_counter(words: &[u32]) -> CounterPacket {
    let edges = (0..EDGES_PER_PACKET)
        .map(|i| EdgeRecord {
            clock: Timestamp::new(words[counter::CLOCK + i], words[counter::OVERFLOW + i]),
            edge_index: words[counter::EDGE_INDEX + i],
        })
        .collect();
    CounterPacket {
        edges,
        quadrature: QuadratureState {
            phase_a: words[counter::QUADRATURE],
            phase_b: words[counter::QUADRATURE + 1],
            phase_c: words[counter::QUADRATURE + 2],
        },
    }
}

fn decode_irig(words: &[u32]) -> IrigFrame {
    let mut frame = IrigFrame {
        rising_edge: Timestamp::new(words[irig::RISING_EDGE], words[irig::INIT_OVERFLOW]),
        ..IrigFrame::default()
    };
    for d in 0..IRIG_DECADES {
        frame.info[d] = words[irig::INFO + d];
        frame.sync_pulses[d] =
            Timestamp::new(words[irig::SYNC_TIME + d], words[irig::SYNC_OVERFLOW + d]);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> IrigFrame {
        let mut frame = IrigFrame {
            rising_edge: Timestamp::new(0xDEAD_BEEF, 2),
            ..IrigFrame::default()
        };
        for d in 0..IRIG_DECADES {
            frame.info[d] = d as u32 * 3;
            frame.sync_pulses[d] = Timestamp::new(1000 * d as u32, 2);
        }
        frame
    }

    #[test]
    fn test_irig_frame_wire_image() {
        let bytes = Packet::Irig(sample_frame()).encode();
        assert_eq!(bytes.len(), 132);
        assert_eq!(&bytes[0..4], &[0xFE, 0xCA, 0, 0]);
        assert_eq!(&bytes[4..8], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(Packet::decode(&bytes).unwrap(), Packet::Irig(sample_frame()));
    }

    #[test]
    fn test_counter_packet_decodes_64_bit_clock() {
        let edges = (0..EDGES_PER_PACKET as u32)
            .map(|i| EdgeRecord {
                clock: Timestamp::new(0xFFFF_0000 + i, 1),
                edge_index: 301 + i,
            })
            .collect();
        let packet = CounterPacket {
            edges,
            quadrature: QuadratureState {
                phase_a: 1,
                phase_b: 0,
                phase_c: 1,
            },
        };
        let bytes = Packet::Counter(packet).encode();
        assert_eq!(bytes.len(), 1816);

        let Packet::Counter(decoded) = Packet::decode(&bytes).unwrap() else {
            panic!("wrong packet kind");
        };
        assert_eq!(decoded.edges[0].clock.logical(), (1u64 << 32) + 0xFFFF_0000);
        assert_eq!(decoded.edges[149].edge_index, 450);
        assert_eq!(decoded.quadrature.phase_c, 1);
    }

    #[test]
    fn test_error_record() {
        let bytes = Packet::Error(ErrorState {
            code: ErrorCode::Desync,
        })
        .encode();
        assert_eq!(bytes.as_ref(), &[0x2A, 0xE1, 0, 0, 1, 0, 0, 0]);
        assert_eq!(
            Packet::decode(&bytes).unwrap(),
            Packet::Error(ErrorState {
                code: ErrorCode::Desync
            })
        );
    }

    #[test]
    fn test_rejects_unknown_header_and_wrong_length() {
        assert!(Packet::decode(&[0x34, 0x12, 0, 0]).is_err());
        assert!(Packet::decode(&[0xFE, 0xCA, 0, 0, 1, 2, 3, 4]).is_err());
        assert!(Packet::decode(&[0xFE, 0xCA, 0]).is_err());
        assert!(Packet::decode(&[]).is_err());
    }
}
