//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Wire-format parsing for RTCP compound packets.
//! See https://tools.ietf.org/html/rfc3550 (SR/RR/SDES/BYE),
//! https://tools.ietf.org/html/rfc3611 (XR),
//! https://tools.ietf.org/html/rfc4585 and https://tools.ietf.org/html/rfc5104
//! (feedback messages), and
//! https://tools.ietf.org/html/draft-alvestrand-rmcat-remb-03 (REMB).

use byteorder::{ReadBytesExt, BE};

use crate::{
    common::{parse_u16, parse_u32, take_bytes, Bits, CheckedSplitAt, Writer},
    ntp::NtpTime,
    tmmbr::TmmbItem,
};

pub type Ssrc = u32;

const VERSION: u8 = 2;
const RTCP_HEADER_LEN: usize = 4;
pub const RTCP_TYPE_SENDER_REPORT: u8 = 200;
pub const RTCP_TYPE_RECEIVER_REPORT: u8 = 201;
pub const RTCP_TYPE_SDES: u8 = 202;
pub const RTCP_TYPE_BYE: u8 = 203;
pub const RTCP_TYPE_GENERIC_FEEDBACK: u8 = 205;
pub const RTCP_TYPE_SPECIFIC_FEEDBACK: u8 = 206;
pub const RTCP_TYPE_EXTENDED_REPORT: u8 = 207;
pub const RTCP_FORMAT_NACK: u8 = 1;
pub const RTCP_FORMAT_TMMBR: u8 = 3;
pub const RTCP_FORMAT_TMMBN: u8 = 4;
pub const RTCP_FORMAT_SR_REQ: u8 = 5;
pub const RTCP_FORMAT_TRANSPORT_CC: u8 = 15;
pub const RTCP_FORMAT_PLI: u8 = 1;
pub const RTCP_FORMAT_SLI: u8 = 2;
pub const RTCP_FORMAT_RPSI: u8 = 3;
pub const RTCP_FORMAT_FIR: u8 = 4;
pub const RTCP_FORMAT_PSFB_APP: u8 = 15;

pub const CNAME_MAX_SIZE: usize = 255;
const SDES_ITEM_CNAME: u8 = 1;
const XR_BLOCK_RRTR: u8 = 4;
const XR_BLOCK_DLRR: u8 = 5;
const REMB_IDENTIFIER: [u8; 4] = *b"REMB";

/// One block of a compound RTCP packet, with the common header already
/// validated and stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpBlock<'packet> {
    pub packet_type: u8,
    pub count_or_format: u8,
    pub payload: &'packet [u8],
}

impl<'packet> RtcpBlock<'packet> {
    /// Parses one RTCP block off the front of a buffer, returning the block
    /// and the rest of the buffer.  Fails on a bad version, a declared
    /// length past the end of the buffer, or an out-of-range padding byte.
    pub fn parse(buffer: &'packet [u8]) -> Option<(Self, &'packet [u8])> {
        let (header, after_header) = buffer.checked_split_at(RTCP_HEADER_LEN)?;
        if (header[0] >> 6) != VERSION {
            return None;
        }
        let has_padding = (header[0] & 0b0010_0000) != 0;
        let count_or_format = header[0] & 0b0001_1111;
        let packet_type = header[1];
        // Length on the wire is in 32-bit words, not counting the header word.
        let payload_len = (parse_u16(&header[2..4]) as usize) * 4;
        let (mut payload, rest) = after_header.checked_split_at(payload_len)?;
        if has_padding {
            let padding_len = *payload.last()? as usize;
            if padding_len == 0 || padding_len > payload.len() {
                return None;
            }
            payload = &payload[..payload.len() - padding_len];
        }
        Some((
            Self {
                packet_type,
                count_or_format,
                payload,
            },
            rest,
        ))
    }
}

/// A reception report block as carried in SR and RR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    pub source_ssrc: Ssrc,
    pub fraction_lost: u8,
    /// 24 bits on the wire.
    pub cumulative_lost: u32,
    pub extended_high_seq_num: u32,
    pub jitter: u32,
    /// Compact NTP of the last SR from this source, or 0.
    pub last_sr: u32,
    /// Delay since that SR in 1/2^16 seconds.
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    pub const SIZE: usize = 24;

    fn parse(reader: &mut &[u8]) -> Option<Self> {
        let source_ssrc = reader.read_u32::<BE>().ok()?;
        let fraction_lost = reader.read_u8().ok()?;
        let cumulative_lost = reader.read_u24::<BE>().ok()?;
        let extended_high_seq_num = reader.read_u32::<BE>().ok()?;
        let jitter = reader.read_u32::<BE>().ok()?;
        let last_sr = reader.read_u32::<BE>().ok()?;
        let delay_since_last_sr = reader.read_u32::<BE>().ok()?;
        Some(Self {
            source_ssrc,
            fraction_lost,
            cumulative_lost,
            extended_high_seq_num,
            jitter,
            last_sr,
            delay_since_last_sr,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub sender_ssrc: Ssrc,
    pub ntp: NtpTime,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub report_blocks: Vec<ReportBlock>,
}

impl SenderReport {
    pub fn parse(payload: &[u8], report_block_count: u8) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let ntp_seconds = reader.read_u32::<BE>().ok()?;
        let ntp_fraction = reader.read_u32::<BE>().ok()?;
        let rtp_timestamp = reader.read_u32::<BE>().ok()?;
        let packet_count = reader.read_u32::<BE>().ok()?;
        let octet_count = reader.read_u32::<BE>().ok()?;
        let report_blocks = parse_report_blocks(&mut reader, report_block_count)?;
        // Anything left is a profile-specific extension; ignore it.
        Some(Self {
            sender_ssrc,
            ntp: NtpTime::new(ntp_seconds, ntp_fraction),
            rtp_timestamp,
            packet_count,
            octet_count,
            report_blocks,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub sender_ssrc: Ssrc,
    pub report_blocks: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn parse(payload: &[u8], report_block_count: u8) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let report_blocks = parse_report_blocks(&mut reader, report_block_count)?;
        Some(Self {
            sender_ssrc,
            report_blocks,
        })
    }
}

fn parse_report_blocks(reader: &mut &[u8], count: u8) -> Option<Vec<ReportBlock>> {
    let mut report_blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        report_blocks.push(ReportBlock::parse(reader)?);
    }
    Some(report_blocks)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: Ssrc,
    pub cname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdes {
    pub chunks: Vec<SdesChunk>,
}

impl Sdes {
    /// Parses SDES chunks.  Only CNAME items are kept; every chunk must be
    /// terminated by a null item and padded to a 32-bit boundary.
    pub fn parse(payload: &[u8], chunk_count: u8) -> Option<Self> {
        let mut chunks = Vec::with_capacity(chunk_count as usize);
        let mut position = 0;
        for _ in 0..chunk_count {
            let ssrc = parse_u32(payload.get(position..position + 4)?);
            position += 4;
            let mut cname = None;
            loop {
                let item_type = *payload.get(position)?;
                position += 1;
                if item_type == 0 {
                    // End of chunk; the terminator and padding fill out the
                    // current 32-bit word.
                    position = (position + 3) & !3;
                    if position > payload.len() {
                        return None;
                    }
                    break;
                }
                let length = *payload.get(position)? as usize;
                position += 1;
                let text = payload.get(position..position + length)?;
                position += length;
                if item_type == SDES_ITEM_CNAME {
                    let text = &text[..text.len().min(CNAME_MAX_SIZE)];
                    cname = Some(String::from_utf8_lossy(text).into_owned());
                }
            }
            chunks.push(SdesChunk { ssrc, cname });
        }
        Some(Self { chunks })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bye {
    pub sender_ssrc: Ssrc,
}

impl Bye {
    /// Additional departing SSRCs and the optional reason are ignored.
    pub fn parse(payload: &[u8], ssrc_count: u8) -> Option<Self> {
        if ssrc_count == 0 {
            return None;
        }
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        take_bytes(&mut reader, 4 * (ssrc_count as usize - 1))?;
        Some(Self { sender_ssrc })
    }
}

/// One DLRR sub-block entry: when the named SSRC last heard our receiver
/// report and how long it sat on it, both in compact NTP units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveTimeInfo {
    pub ssrc: Ssrc,
    pub last_rr: u32,
    pub delay_since_last_rr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedReports {
    pub sender_ssrc: Ssrc,
    pub rrtrs: Vec<NtpTime>,
    pub dlrr_time_infos: Vec<ReceiveTimeInfo>,
}

impl ExtendedReports {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let mut rrtrs = Vec::new();
        let mut dlrr_time_infos = Vec::new();
        while !reader.is_empty() {
            let block_type = reader.read_u8().ok()?;
            let _reserved = reader.read_u8().ok()?;
            let block_len_words = reader.read_u16::<BE>().ok()?;
            let body = take_bytes(&mut reader, 4 * block_len_words as usize)?;
            match block_type {
                XR_BLOCK_RRTR => {
                    if block_len_words != 2 {
                        return None;
                    }
                    let mut body = body;
                    let seconds = body.read_u32::<BE>().ok()?;
                    let fraction = body.read_u32::<BE>().ok()?;
                    rrtrs.push(NtpTime::new(seconds, fraction));
                }
                XR_BLOCK_DLRR => {
                    if body.len() % 12 != 0 {
                        return None;
                    }
                    let mut body = body;
                    while !body.is_empty() {
                        let ssrc = body.read_u32::<BE>().ok()?;
                        let last_rr = body.read_u32::<BE>().ok()?;
                        let delay_since_last_rr = body.read_u32::<BE>().ok()?;
                        dlrr_time_infos.push(ReceiveTimeInfo {
                            ssrc,
                            last_rr,
                            delay_since_last_rr,
                        });
                    }
                }
                _ => {
                    // Unknown report block; skip it.
                }
            }
        }
        Some(Self {
            sender_ssrc,
            rrtrs,
            dlrr_time_infos,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    pub seqnums: Vec<u16>,
}

impl Nack {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let media_ssrc = reader.read_u32::<BE>().ok()?;
        if reader.is_empty() || reader.len() % 4 != 0 {
            return None;
        }
        let mut seqnums = Vec::new();
        while !reader.is_empty() {
            let first_seqnum = reader.read_u16::<BE>().ok()?;
            let mask = reader.read_u16::<BE>().ok()?;
            let entry_seqnums =
                std::iter::once(first_seqnum).chain((0..16u16).filter_map(move |index| {
                    if mask.ls_bit(index as u8) {
                        Some(first_seqnum.wrapping_add(index + 1))
                    } else {
                        None
                    }
                }));
            seqnums.extend(entry_seqnums);
        }
        Some(Self {
            sender_ssrc,
            media_ssrc,
            seqnums,
        })
    }
}

// This will only work well if the iterator provides seqnums in order.
pub fn write_nack(
    sender_ssrc: Ssrc,
    media_ssrc: Ssrc,
    mut seqnums: impl Iterator<Item = u16>,
) -> impl Writer {
    let mut items: Vec<(u16, u16)> = vec![];
    if let Some(mut first_seqnum) = seqnums.next() {
        let mut mask = 0u16;
        for seqnum in seqnums {
            let diff = seqnum.wrapping_sub(first_seqnum);
            if (1..=16).contains(&diff) {
                let index = (diff - 1) as u8;
                mask = mask.set_ls_bit(index);
            } else {
                // Record this item and start another
                items.push((first_seqnum, mask));
                first_seqnum = seqnum;
                mask = 0u16;
            }
        }
        items.push((first_seqnum, mask))
    }
    (sender_ssrc, media_ssrc, items)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tmmbr {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    pub requests: Vec<TmmbItem>,
}

impl Tmmbr {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let media_ssrc = reader.read_u32::<BE>().ok()?;
        let requests = parse_tmmb_items(&mut reader)?;
        if requests.is_empty() {
            return None;
        }
        Some(Self {
            sender_ssrc,
            media_ssrc,
            requests,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tmmbn {
    pub sender_ssrc: Ssrc,
    pub items: Vec<TmmbItem>,
}

impl Tmmbn {
    /// An empty item list is valid: it tells us no restriction applies.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let _media_ssrc = reader.read_u32::<BE>().ok()?;
        let items = parse_tmmb_items(&mut reader)?;
        Some(Self { sender_ssrc, items })
    }
}

fn parse_tmmb_items(reader: &mut &[u8]) -> Option<Vec<TmmbItem>> {
    if reader.len() % 8 != 0 {
        return None;
    }
    let mut items = Vec::with_capacity(reader.len() / 8);
    while !reader.is_empty() {
        let ssrc = reader.read_u32::<BE>().ok()?;
        let packed = reader.read_u32::<BE>().ok()?;
        // 6-bit exponent, 17-bit mantissa, 9-bit per-packet overhead.
        let exponent = packed >> 26;
        let mantissa = (packed >> 9) & 0x1FFFF;
        let packet_overhead = (packed & 0x1FF) as u16;
        let bitrate_bps = (mantissa as u64) << exponent;
        if (bitrate_bps >> exponent) != mantissa as u64 {
            // The shift overflowed.
            return None;
        }
        items.push(TmmbItem {
            ssrc,
            bitrate_bps,
            packet_overhead,
        });
    }
    Some(items)
}

fn pack_tmmb_entry(item: &TmmbItem) -> (u32, u32) {
    let mut exponent = 0u32;
    let mut mantissa = item.bitrate_bps;
    while mantissa > 0x1FFFF {
        mantissa >>= 1;
        exponent += 1;
    }
    let packed =
        (exponent << 26) | ((mantissa as u32) << 9) | (item.packet_overhead as u32 & 0x1FF);
    (item.ssrc, packed)
}

pub fn write_tmmbr(sender_ssrc: Ssrc, media_ssrc: Ssrc, requests: &[TmmbItem]) -> impl Writer {
    let entries: Vec<(u32, u32)> = requests.iter().map(pack_tmmb_entry).collect();
    (sender_ssrc, media_ssrc, entries)
}

pub fn write_tmmbn(sender_ssrc: Ssrc, items: &[TmmbItem]) -> impl Writer {
    let entries: Vec<(u32, u32)> = items.iter().map(pack_tmmb_entry).collect();
    (sender_ssrc, 0u32, entries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remb {
    pub sender_ssrc: Ssrc,
    pub bitrate_bps: u64,
    pub ssrcs: Vec<Ssrc>,
}

impl Remb {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let media_ssrc = reader.read_u32::<BE>().ok()?;
        if media_ssrc != 0 {
            return None;
        }
        let identifier = take_bytes(&mut reader, 4)?;
        if identifier != REMB_IDENTIFIER {
            return None;
        }
        let num_ssrcs = reader.read_u8().ok()?;
        // 6-bit exponent, 18-bit mantissa.
        let byte = reader.read_u8().ok()?;
        let exponent = (byte >> 2) as u32;
        let mantissa = (((byte & 0b11) as u32) << 16) | reader.read_u16::<BE>().ok()? as u32;
        let bitrate_bps = (mantissa as u64) << exponent;
        if (bitrate_bps >> exponent) != mantissa as u64 {
            // The shift overflowed.
            return None;
        }
        if reader.len() != 4 * num_ssrcs as usize {
            return None;
        }
        let mut ssrcs = Vec::with_capacity(num_ssrcs as usize);
        for _ in 0..num_ssrcs {
            ssrcs.push(reader.read_u32::<BE>().ok()?);
        }
        Some(Self {
            sender_ssrc,
            bitrate_bps,
            ssrcs,
        })
    }
}

pub fn write_remb(sender_ssrc: Ssrc, bitrate_bps: u64, ssrcs: &[Ssrc]) -> impl Writer {
    let mut exponent = 0u8;
    let mut mantissa = bitrate_bps;
    while mantissa > 0x3FFFF {
        mantissa >>= 1;
        exponent += 1;
    }
    (
        sender_ssrc,
        0u32,
        REMB_IDENTIFIER,
        [
            ssrcs.len() as u8,
            (exponent << 2) | ((mantissa >> 16) as u8 & 0b11),
        ],
        ((mantissa & 0xFFFF) as u16, ssrcs.to_vec()),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
}

impl Pli {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let media_ssrc = reader.read_u32::<BE>().ok()?;
        Some(Self {
            sender_ssrc,
            media_ssrc,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliEntry {
    pub first: u16,
    pub number: u16,
    pub picture_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sli {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    pub macroblocks: Vec<SliEntry>,
}

impl Sli {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let media_ssrc = reader.read_u32::<BE>().ok()?;
        if reader.is_empty() || reader.len() % 4 != 0 {
            return None;
        }
        let mut macroblocks = Vec::with_capacity(reader.len() / 4);
        while !reader.is_empty() {
            // 13-bit first macroblock, 13-bit count, 6-bit picture id.
            let bits = reader.read_u32::<BE>().ok()?;
            macroblocks.push(SliEntry {
                first: (bits >> 19) as u16,
                number: ((bits >> 6) & 0x1FFF) as u16,
                picture_id: (bits & 0x3F) as u8,
            });
        }
        Some(Self {
            sender_ssrc,
            media_ssrc,
            macroblocks,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rpsi {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    pub payload_type: u8,
    pub picture_id: u64,
}

impl Rpsi {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let media_ssrc = reader.read_u32::<BE>().ok()?;
        let padding_bits = reader.read_u8().ok()?;
        let payload_type = reader.read_u8().ok()?;
        if payload_type & 0x80 != 0 {
            return None;
        }
        if padding_bits % 8 != 0 {
            return None;
        }
        let padding_bytes = (padding_bits / 8) as usize;
        if reader.len() <= padding_bytes {
            return None;
        }
        let native = &reader[..reader.len() - padding_bytes];
        // The native bit string carries the picture id in 7-bit groups.
        let mut picture_id = 0u64;
        for byte in native {
            picture_id = (picture_id << 7) | (byte & 0x7F) as u64;
        }
        Some(Self {
            sender_ssrc,
            media_ssrc,
            payload_type,
            picture_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirRequest {
    pub ssrc: Ssrc,
    pub seq_nr: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fir {
    pub sender_ssrc: Ssrc,
    pub requests: Vec<FirRequest>,
}

impl Fir {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        // The media SSRC SHOULD be 0; either way the targets are in the FCI.
        let _media_ssrc = reader.read_u32::<BE>().ok()?;
        if reader.is_empty() || reader.len() % 8 != 0 {
            return None;
        }
        let mut requests = Vec::with_capacity(reader.len() / 8);
        while !reader.is_empty() {
            let ssrc = reader.read_u32::<BE>().ok()?;
            let seq_nr = reader.read_u8().ok()?;
            take_bytes(&mut reader, 3)?;
            requests.push(FirRequest { ssrc, seq_nr });
        }
        Some(Self {
            sender_ssrc,
            requests,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RapidResyncRequest {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
}

impl RapidResyncRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != 8 {
            return None;
        }
        let mut reader = payload;
        let sender_ssrc = reader.read_u32::<BE>().ok()?;
        let media_ssrc = reader.read_u32::<BE>().ok()?;
        Some(Self {
            sender_ssrc,
            media_ssrc,
        })
    }
}

/// Serializes a complete RTCP block: common header plus payload.
/// The payload must already be padded to a 32-bit boundary.
// pub for tests and for echoing feedback back to a peer.
pub fn write_rtcp(packet_type: u8, count_or_format: u8, payload: &impl Writer) -> Vec<u8> {
    let payload = payload.to_vec();
    assert!(payload.len() % 4 == 0, "payload must be word-aligned");
    let payload_len_in_words = (payload.len() / 4) as u16;
    let mut serialized = Vec::with_capacity(RTCP_HEADER_LEN + payload.len());
    serialized.push((VERSION << 6) | (count_or_format & 0b0001_1111));
    serialized.push(packet_type);
    serialized.extend_from_slice(&payload_len_in_words.to_be_bytes());
    serialized.extend_from_slice(&payload);
    serialized
}
