//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Parser for transport-wide congestion control feedback, per
//! https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01

use std::time::Duration;

use byteorder::{ReadBytesExt, BE};

use crate::rtcp::Ssrc;

pub type TruncatedSequenceNumber = u16;

// The reference time is counted in 64 ms ticks, the per-packet receive
// deltas in 250 us ticks.
const REFERENCE_TICK_MICROS: i64 = 64_000;
const DELTA_TICK_MICROS: i64 = 250;

/// When a packet reached the remote end, measured on whatever clock the
/// remote picked for its feedback.  Only values from the same connection
/// can be related to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteArrivalTime {
    micros: u64,
}

impl RemoteArrivalTime {
    pub fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    pub fn as_micros(self) -> u64 {
        self.micros
    }

    pub fn duration_since(self, earlier: RemoteArrivalTime) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(earlier.micros))
    }
}

/// A parsed feedback message: which media SSRC it acks and when each
/// sequence number arrived at the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub media_ssrc: Ssrc,
    pub base_seqnum: TruncatedSequenceNumber,
    pub status_count: u16,
    pub feedback_seqnum: u8,
    pub arrivals: Vec<(TruncatedSequenceNumber, RemoteArrivalTime)>,
}

impl Feedback {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let _sender_ssrc = reader.read_u32::<BE>().ok()?;
        let media_ssrc = reader.read_u32::<BE>().ok()?;
        let base_seqnum = reader.read_u16::<BE>().ok()?;
        let status_count = reader.read_u16::<BE>().ok()?;
        let reference_time_ticks = reader.read_u24::<BE>().ok()?;
        let feedback_seqnum = reader.read_u8().ok()?;

        // The status chunks come first, then one receive delta per received
        // packet.  The last chunk may describe more packets than the status
        // count; the excess symbols carry no deltas.
        let mut statuses = Vec::with_capacity(status_count as usize);
        while statuses.len() < status_count as usize {
            let encoded = reader.read_u16::<BE>().ok()?;
            decode_status_chunk(encoded, &mut statuses)?;
        }

        let mut arrivals = Vec::new();
        let mut delta_ticks_sum: i64 = 0;
        for (index, status) in statuses.iter().take(status_count as usize).enumerate() {
            let delta_ticks = match status {
                PacketStatus::NotReceived => continue,
                PacketStatus::SmallDelta => reader.read_u8().ok()? as i64,
                PacketStatus::LargeOrNegativeDelta => reader.read_i16::<BE>().ok()? as i64,
            };
            delta_ticks_sum += delta_ticks;
            let arrival_micros = REFERENCE_TICK_MICROS * reference_time_ticks as i64
                + DELTA_TICK_MICROS * delta_ticks_sum;
            arrivals.push((
                base_seqnum.wrapping_add(index as u16),
                RemoteArrivalTime::from_micros(arrival_micros.max(0) as u64),
            ));
        }
        Some(Self {
            media_ssrc,
            base_seqnum,
            status_count,
            feedback_seqnum,
            arrivals,
        })
    }
}

/// How a packet's arrival is marked in the status chunks, which decides how
/// many bytes of receive delta it contributes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum PacketStatus {
    NotReceived,
    SmallDelta,
    LargeOrNegativeDelta,
}

impl PacketStatus {
    fn from_symbol(symbol: u8) -> Option<Self> {
        match symbol {
            0b00 => Some(Self::NotReceived),
            0b01 => Some(Self::SmallDelta),
            0b10 => Some(Self::LargeOrNegativeDelta),
            // 0b11 is reserved.
            _ => None,
        }
    }
}

/// Appends the statuses described by one 16-bit chunk.  A run-length chunk
/// (top bit 0) repeats a single status up to 8191 times; a status vector
/// chunk (top bit 1) holds fourteen 1-bit or seven 2-bit symbols, most
/// significant first.
fn decode_status_chunk(encoded: u16, statuses: &mut Vec<PacketStatus>) -> Option<()> {
    if encoded & 0x8000 == 0 {
        let status = PacketStatus::from_symbol(((encoded >> 13) & 0b11) as u8)?;
        let run_length = (encoded & 0x1FFF) as usize;
        statuses.extend(std::iter::repeat(status).take(run_length));
    } else if encoded & 0x4000 == 0 {
        for bit in (0..14).rev() {
            statuses.push(PacketStatus::from_symbol(((encoded >> bit) & 0b1) as u8)?);
        }
    } else {
        for pair in (0..7).rev() {
            statuses.push(PacketStatus::from_symbol(((encoded >> (pair * 2)) & 0b11) as u8)?);
        }
    }
    Some(())
}
