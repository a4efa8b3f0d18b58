//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The RTCP receive pipeline: ingests compound RTCP datagrams, keeps
//! per-remote-sender statistics (RTT, loss, jitter, CNAMEs, TMMBR/TMMBN
//! state, XR timestamps), detects receiver-side timeouts, and dispatches
//! events to the owner and the registered observers.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use log::*;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    ntp::{compact_ntp_rtt_to_ms, NtpTime},
    rtcp::{
        Bye, ExtendedReports, Fir, Nack, Pli, RapidResyncRequest, ReceiveTimeInfo, ReceiverReport,
        Remb, ReportBlock, Rpsi, RtcpBlock, Sdes, SenderReport, Sli, Ssrc, Tmmbn, Tmmbr,
        RTCP_FORMAT_FIR, RTCP_FORMAT_NACK, RTCP_FORMAT_PLI, RTCP_FORMAT_PSFB_APP,
        RTCP_FORMAT_RPSI, RTCP_FORMAT_SLI, RTCP_FORMAT_SR_REQ, RTCP_FORMAT_TMMBN,
        RTCP_FORMAT_TMMBR, RTCP_FORMAT_TRANSPORT_CC, RTCP_TYPE_BYE, RTCP_TYPE_EXTENDED_REPORT,
        RTCP_TYPE_GENERIC_FEEDBACK, RTCP_TYPE_RECEIVER_REPORT, RTCP_TYPE_SDES,
        RTCP_TYPE_SENDER_REPORT, RTCP_TYPE_SPECIFIC_FEEDBACK,
    },
    tmmbr::{self, TmmbItem},
    transportcc,
};

/// The number of RTCP time intervals needed to trigger a timeout.
pub const RR_TIMEOUT_INTERVALS: u64 = 3;
/// We don't know what report interval the remote peer uses, so liveness and
/// TMMBR expiry are measured against the audio default.
pub const RTCP_INTERVAL_AUDIO_MS: u64 = 5_000;
const TMMBR_TIMEOUT_MS: u64 = 5 * RTCP_INTERVAL_AUDIO_MS;
/// The shortest time between honored FIRs from the same sender.
pub const MIN_FIR_INTERVAL_MS: u64 = 150;
const MAX_WARNING_LOG_INTERVAL_MS: u64 = 10_000;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("received empty RTCP packet")]
    ReceivedEmptyRtcp,
    #[error("received invalid RTCP packet")]
    ReceivedInvalidRtcp,
}

/// A report block as stored and handed to callbacks, stamped with the remote
/// sender it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceivedReportBlock {
    pub remote_ssrc: Ssrc,
    pub source_ssrc: Ssrc,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub extended_high_seq_num: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// Round-trip time statistics for one (remote sender, local source) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RttStats {
    pub rtt_ms: u64,
    pub avg_rtt_ms: u64,
    pub min_rtt_ms: u64,
    pub max_rtt_ms: u64,
}

/// The latest sender report fields from the designated remote sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteSenderInfo {
    pub ntp: NtpTime,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// The NTP pair of the latest accepted sender report: what the remote wrote
/// and when it arrived here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpInfo {
    pub remote_ntp: NtpTime,
    pub arrival_ntp: NtpTime,
    pub rtp_timestamp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtcpStatistics {
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub extended_max_sequence_number: u32,
    pub jitter: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtcpPacketTypeCounter {
    pub nack_packets: u32,
    pub pli_packets: u32,
    pub fir_packets: u32,
    pub nack_requests: u32,
    pub unique_nack_requests: u32,
    pub first_packet_time_ms: Option<u64>,
}

/// The capability object through which the receive pipeline reaches back
/// into its owning endpoint.  The owner holds the receiver; the receiver
/// only holds this.
pub trait RtcpOwner: Send + Sync {
    fn set_tmmbn(&self, bounding_set: Vec<TmmbItem>);
    fn on_request_send_report(&self);
    fn on_received_nack(&self, nack_sequence_numbers: &[u16]);
    fn on_received_rtcp_report_blocks(&self, report_blocks: &[ReceivedReportBlock]);
}

pub trait BandwidthObserver: Send + Sync {
    fn on_received_estimated_bitrate(&self, bitrate_bps: u64);
    fn on_received_rtcp_receiver_report(
        &self,
        report_blocks: &[ReceivedReportBlock],
        rtt_ms: u64,
        now_ms: u64,
    );
}

pub trait IntraFrameObserver: Send + Sync {
    fn on_received_intra_frame_request(&self, ssrc: Ssrc);
    fn on_received_sli(&self, ssrc: Ssrc, picture_id: u8);
    fn on_received_rpsi(&self, ssrc: Ssrc, picture_id: u64);
    fn on_local_ssrc_changed(&self, old_ssrc: Ssrc, new_ssrc: Ssrc);
}

pub trait TransportFeedbackObserver: Send + Sync {
    fn on_transport_feedback(&self, feedback: &transportcc::Feedback);
}

pub trait StatisticsObserver: Send + Sync {
    fn statistics_updated(&self, statistics: RtcpStatistics, ssrc: Ssrc);
    fn cname_changed(&self, cname: &str, ssrc: Ssrc);
}

pub trait PacketTypeCounterObserver: Send + Sync {
    fn rtcp_packet_types_counter_updated(&self, ssrc: Ssrc, counter: &RtcpPacketTypeCounter);
}

/// The optional observers, independently installable.
#[derive(Default)]
pub struct Observers {
    pub packet_type_counter: Option<Arc<dyn PacketTypeCounterObserver>>,
    pub bandwidth: Option<Arc<dyn BandwidthObserver>>,
    pub intra_frame: Option<Arc<dyn IntraFrameObserver>>,
    pub transport_feedback: Option<Arc<dyn TransportFeedbackObserver>>,
}

/// Everything observed in one compound datagram, assembled under the state
/// lock and consumed outside of it.
#[derive(Debug, Default)]
pub struct PacketInformation {
    pub packet_type_flags: u32,
    pub remote_ssrc: Ssrc,
    pub nack_sequence_numbers: Vec<u16>,
    pub report_blocks: Vec<ReceivedReportBlock>,
    /// The latest RTT sample for the (remote, main SSRC) pair.
    pub rtt_ms: u64,
    pub receiver_estimated_max_bitrate_bps: u64,
    pub sli_picture_id: u8,
    pub rpsi_picture_id: u64,
    pub sdes_cnames: Vec<(Ssrc, String)>,
    pub xr_originator_ssrc: Ssrc,
    pub xr_dlrr_item: bool,
    pub transport_feedback: Option<transportcc::Feedback>,
}

impl PacketInformation {
    pub const SR: u32 = 1 << 0;
    pub const RR: u32 = 1 << 1;
    pub const SDES: u32 = 1 << 2;
    pub const NACK: u32 = 1 << 3;
    pub const PLI: u32 = 1 << 4;
    pub const FIR: u32 = 1 << 5;
    pub const SLI: u32 = 1 << 6;
    pub const RPSI: u32 = 1 << 7;
    pub const TMMBR: u32 = 1 << 8;
    pub const TMMBN: u32 = 1 << 9;
    pub const SR_REQ: u32 = 1 << 10;
    pub const REMB: u32 = 1 << 11;
    pub const XR_RECEIVER_REFERENCE_TIME: u32 = 1 << 12;
    pub const XR_DLRR_REPORT_BLOCK: u32 = 1 << 13;
    pub const TRANSPORT_FEEDBACK: u32 = 1 << 14;

    pub fn has(&self, flags: u32) -> bool {
        self.packet_type_flags & flags != 0
    }

    fn add(&mut self, flags: u32) {
        self.packet_type_flags |= flags;
    }
}

#[derive(Debug, Default)]
struct ReportBlockInformation {
    received: ReceivedReportBlock,
    max_jitter: u32,
    stats: RttStats,
    // min_rtt_ms == 0 means no sample yet, so the count only feeds the
    // running average.
    rtt_sample_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct TimedTmmbrItem {
    item: TmmbItem,
    last_updated_ms: u64,
}

#[derive(Debug, Default)]
struct ReceiveInformation {
    /// When we last heard an SR or RR from this sender; 0 once the liveness
    /// timeout has fired.
    last_time_received_ms: u64,
    last_fir_sequence_number: Option<u8>,
    last_fir_request_ms: u64,
    /// Active TMMBR requests keyed by the requesting SSRC.
    tmmbr: HashMap<Ssrc, TimedTmmbrItem>,
    /// The sender's latest TMMBN bounding set.
    tmmbn: Vec<TmmbItem>,
    /// Set on BYE; the entry is erased by the next timer sweep.
    ready_for_delete: bool,
}

#[derive(Debug, Default)]
struct NackStats {
    max_sequence_number: u16,
    requests: u32,
    unique_requests: u32,
}

impl NackStats {
    fn report_request(&mut self, sequence_number: u16) {
        if self.requests == 0
            || is_newer_sequence_number(sequence_number, self.max_sequence_number)
        {
            self.max_sequence_number = sequence_number;
            self.unique_requests += 1;
        }
        self.requests += 1;
    }
}

fn is_newer_sequence_number(value: u16, prev_value: u16) -> bool {
    // Break the tie exactly half the sequence space apart by value.
    if value.wrapping_sub(prev_value) == 0x8000 {
        return value > prev_value;
    }
    value != prev_value && value.wrapping_sub(prev_value) < 0x8000
}

#[derive(Default)]
struct State {
    main_ssrc: Ssrc,
    remote_ssrc: Ssrc,
    registered_ssrcs: HashSet<Ssrc>,

    remote_sender_info: RemoteSenderInfo,
    /// Local NTP when we accepted the last SR from the designated remote.
    last_received_sr_ntp: NtpTime,

    remote_xr_receive_time_info: ReceiveTimeInfo,
    /// Local NTP when the last RRTR arrived.
    last_received_xr_ntp: NtpTime,
    xr_rrtr_status: bool,
    /// One-shot RTT estimate from a DLRR block; 0 when there is none.
    xr_rr_rtt_ms: u64,

    /// source SSRC -> remote SSRC -> statistics.
    report_blocks: HashMap<Ssrc, HashMap<Ssrc, ReportBlockInformation>>,
    receive_info: HashMap<Ssrc, ReceiveInformation>,
    cnames: HashMap<Ssrc, String>,

    last_received_rr_ms: u64,
    /// The last time an RR told us the remote saw a new sequence number.
    last_increased_sequence_number_ms: u64,

    packet_type_counter: RtcpPacketTypeCounter,
    nack_stats: NackStats,

    num_skipped_packets: u64,
    last_skipped_packets_warning_ms: u64,
}

pub struct RtcpReceiver {
    receiver_only: bool,
    owner: Arc<dyn RtcpOwner>,
    packet_type_counter_observer: Option<Arc<dyn PacketTypeCounterObserver>>,
    bandwidth_observer: Option<Arc<dyn BandwidthObserver>>,
    intra_frame_observer: Option<Arc<dyn IntraFrameObserver>>,
    transport_feedback_observer: Option<Arc<dyn TransportFeedbackObserver>>,

    state: Mutex<State>,
    // Kept apart from the state lock so the stats callback is never invoked
    // with the state locked.
    stats_observer: Mutex<Option<Arc<dyn StatisticsObserver>>>,
}

impl RtcpReceiver {
    pub fn new(receiver_only: bool, observers: Observers, owner: Arc<dyn RtcpOwner>) -> Self {
        Self {
            receiver_only,
            owner,
            packet_type_counter_observer: observers.packet_type_counter,
            bandwidth_observer: observers.bandwidth,
            intra_frame_observer: observers.intra_frame,
            transport_feedback_observer: observers.transport_feedback,
            state: Mutex::new(State::default()),
            stats_observer: Mutex::new(None),
        }
    }

    /// Ingests one compound RTCP datagram.  Fails only when nothing at all
    /// could be extracted from it.
    pub fn incoming_packet(&self, packet: &[u8], now: NtpTime) -> Result<(), Error> {
        if packet.is_empty() {
            warn!("Incoming empty RTCP packet");
            return Err(Error::ReceivedEmptyRtcp);
        }
        let packet_information = self
            .parse_compound_packet(packet, now)
            .ok_or(Error::ReceivedInvalidRtcp)?;
        self.trigger_callbacks(packet_information, now);
        Ok(())
    }

    pub fn set_ssrcs(&self, main_ssrc: Ssrc, registered_ssrcs: HashSet<Ssrc>) {
        let old_ssrc = {
            let mut state = self.state.lock();
            let old_ssrc = state.main_ssrc;
            state.main_ssrc = main_ssrc;
            state.registered_ssrcs = registered_ssrcs;
            old_ssrc
        };
        if old_ssrc != main_ssrc {
            if let Some(observer) = &self.intra_frame_observer {
                observer.on_local_ssrc_changed(old_ssrc, main_ssrc);
            }
        }
    }

    pub fn set_remote_ssrc(&self, ssrc: Ssrc) {
        let mut state = self.state.lock();
        // A new SSRC resets the old reports.
        state.remote_sender_info = RemoteSenderInfo::default();
        state.last_received_sr_ntp = NtpTime::ZERO;
        state.remote_ssrc = ssrc;
    }

    pub fn remote_ssrc(&self) -> Ssrc {
        self.state.lock().remote_ssrc
    }

    pub fn set_rtcp_xr_rrtr_status(&self, enable: bool) {
        self.state.lock().xr_rrtr_status = enable;
    }

    pub fn register_statistics_observer(&self, observer: Option<Arc<dyn StatisticsObserver>>) {
        *self.stats_observer.lock() = observer;
    }

    /// RTT statistics for the (remote sender, main SSRC) pair.
    pub fn rtt(&self, remote_ssrc: Ssrc) -> Option<RttStats> {
        let state = self.state.lock();
        let info = state
            .report_blocks
            .get(&state.main_ssrc)?
            .get(&remote_ssrc)?;
        Some(info.stats)
    }

    /// The latest accepted sender report's NTP pair, or None before any SR.
    pub fn ntp(&self) -> Option<NtpInfo> {
        let state = self.state.lock();
        if state.last_received_sr_ntp.is_zero() {
            return None;
        }
        Some(NtpInfo {
            remote_ntp: state.remote_sender_info.ntp,
            arrival_ntp: state.last_received_sr_ntp,
            rtp_timestamp: state.remote_sender_info.rtp_timestamp,
        })
    }

    pub fn sender_info(&self) -> Option<RemoteSenderInfo> {
        let state = self.state.lock();
        if state.last_received_sr_ntp.is_zero() {
            return None;
        }
        Some(state.remote_sender_info)
    }

    pub fn cname(&self, remote_ssrc: Ssrc) -> Option<String> {
        self.state.lock().cnames.get(&remote_ssrc).cloned()
    }

    /// All report blocks we have stored, across every (source, remote) pair.
    pub fn statistics_received(&self) -> Vec<ReceivedReportBlock> {
        let state = self.state.lock();
        state
            .report_blocks
            .values()
            .flat_map(|info_map| info_map.values().map(|info| info.received))
            .collect()
    }

    /// When we last heard an SR or RR from any remote sender.
    pub fn last_received_receiver_report_ms(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .receive_info
            .values()
            .map(|info| info.last_time_received_ms)
            .filter(|last_time_received_ms| *last_time_received_ms > 0)
            .max()
    }

    /// The one-shot RTT estimate from XR DLRR blocks; reading it clears it.
    pub fn get_and_reset_xr_rr_rtt(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.xr_rr_rtt_ms == 0 {
            return None;
        }
        let rtt_ms = state.xr_rr_rtt_ms;
        state.xr_rr_rtt_ms = 0;
        Some(rtt_ms)
    }

    /// The last received RRTR with the delay since it arrived, both in
    /// compact NTP, ready to be echoed in a DLRR block.
    pub fn last_received_xr_reference_time_info(&self, now: NtpTime) -> Option<ReceiveTimeInfo> {
        let state = self.state.lock();
        if state.last_received_xr_ntp.is_zero() {
            return None;
        }
        let receive_time = state.last_received_xr_ntp.compact();
        Some(ReceiveTimeInfo {
            ssrc: state.remote_xr_receive_time_info.ssrc,
            last_rr: state.remote_xr_receive_time_info.last_rr,
            delay_since_last_rr: now.compact().wrapping_sub(receive_time),
        })
    }

    /// True at most once after RRs stop arriving, until a new RR arrives.
    pub fn rtcp_rr_timeout(&self, rtcp_interval: Duration, now: NtpTime) -> bool {
        let mut state = self.state.lock();
        edge_triggered_timeout(&mut state.last_received_rr_ms, rtcp_interval, now)
    }

    /// True at most once after RRs stop reporting sequence number progress,
    /// until a new RR shows progress.
    pub fn rtcp_rr_sequence_number_timeout(&self, rtcp_interval: Duration, now: NtpTime) -> bool {
        let mut state = self.state.lock();
        edge_triggered_timeout(&mut state.last_increased_sequence_number_ms, rtcp_interval, now)
    }

    /// Prunes tombstoned senders and expires the TMMBR limits of silent
    /// ones.  Returns whether the bounding set must be recomputed.
    pub fn update_receive_information_timers(&self, now: NtpTime) -> bool {
        let mut state = self.state.lock();
        let now_ms = now.to_millis();
        let mut bounding_set_changed = false;
        state.receive_info.retain(|_, info| {
            if info.ready_for_delete {
                return false;
            }
            if info.last_time_received_ms > 0
                && now_ms.saturating_sub(info.last_time_received_ms) > TMMBR_TIMEOUT_MS
            {
                // No RTCP for five regular intervals; lift this sender's
                // limits and zero the stamp so this fires only once.
                info.tmmbr.clear();
                info.last_time_received_ms = 0;
                bounding_set_changed = true;
            }
            true
        });
        bounding_set_changed
    }

    /// All active (non-stale) TMMBR candidates; stale entries are dropped.
    pub fn tmmbr_received(&self, now: NtpTime) -> Vec<TmmbItem> {
        let mut state = self.state.lock();
        let now_ms = now.to_millis();
        let mut candidates = Vec::new();
        for info in state.receive_info.values_mut() {
            info.tmmbr
                .retain(|_, timed| now_ms.saturating_sub(timed.last_updated_ms) <= TMMBR_TIMEOUT_MS);
            candidates.extend(info.tmmbr.values().map(|timed| timed.item));
        }
        candidates
    }

    /// The designated remote sender's TMMBN list and whether our main SSRC
    /// is named by it.
    pub fn bounding_set(&self) -> (Vec<TmmbItem>, bool) {
        let state = self.state.lock();
        match state.receive_info.get(&state.remote_ssrc) {
            None => (Vec::new(), false),
            Some(info) => {
                let tmmbr_owner = tmmbr::is_owner(&info.tmmbn, state.main_ssrc);
                (info.tmmbn.clone(), tmmbr_owner)
            }
        }
    }

    /// Recomputes the bounding set from the current candidates, reports the
    /// resulting minimum bitrate, and hands the set to the owner for TMMBN.
    pub fn update_tmmbr(&self, now: NtpTime) {
        let bounding_set = tmmbr::find_bounding_set(self.tmmbr_received(now));
        if !bounding_set.is_empty() {
            if let Some(observer) = &self.bandwidth_observer {
                if let Some(bitrate_bps) = tmmbr::calc_min_bitrate_bps(&bounding_set) {
                    if bitrate_bps <= u32::MAX as u64 {
                        observer.on_received_estimated_bitrate(bitrate_bps);
                    }
                }
            }
        }
        self.owner.set_tmmbn(bounding_set);
    }

    // pub for tests
    pub fn num_skipped_packets(&self) -> u64 {
        self.state.lock().num_skipped_packets
    }

    /// Phase 1: walk the compound packet and update the state tables under
    /// the state lock, assembling the aggregate for phase 2.
    fn parse_compound_packet(&self, packet: &[u8], now: NtpTime) -> Option<PacketInformation> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut packet_information = PacketInformation::default();

        let mut remaining = packet;
        while !remaining.is_empty() {
            let (block, rest) = match RtcpBlock::parse(remaining) {
                Some(parsed) => parsed,
                None => {
                    if remaining.len() == packet.len() {
                        // Failed to parse the first header; nothing was
                        // extracted from this packet.
                        warn!("Incoming invalid RTCP packet");
                        warn!("{}", hex::encode(&packet[..packet.len().min(100)]));
                        return None;
                    }
                    state.num_skipped_packets += 1;
                    break;
                }
            };
            remaining = rest;

            if state.packet_type_counter.first_packet_time_ms.is_none() {
                state.packet_type_counter.first_packet_time_ms = Some(now.to_millis());
            }

            match (block.packet_type, block.count_or_format) {
                (RTCP_TYPE_SENDER_REPORT, _) => {
                    self.handle_sender_report(state, &block, &mut packet_information, now)
                }
                (RTCP_TYPE_RECEIVER_REPORT, _) => {
                    self.handle_receiver_report(state, &block, &mut packet_information, now)
                }
                (RTCP_TYPE_SDES, _) => self.handle_sdes(state, &block, &mut packet_information),
                (RTCP_TYPE_BYE, _) => self.handle_bye(state, &block),
                (RTCP_TYPE_EXTENDED_REPORT, _) => {
                    self.handle_xr(state, &block, &mut packet_information, now)
                }
                (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_NACK) => {
                    self.handle_nack(state, &block, &mut packet_information)
                }
                (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_TMMBR) => {
                    self.handle_tmmbr(state, &block, &mut packet_information, now)
                }
                (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_TMMBN) => {
                    self.handle_tmmbn(state, &block, &mut packet_information)
                }
                (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_SR_REQ) => {
                    self.handle_sr_request(state, &block, &mut packet_information)
                }
                (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_TRANSPORT_CC) => {
                    self.handle_transport_feedback(state, &block, &mut packet_information)
                }
                (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_PLI) => {
                    self.handle_pli(state, &block, &mut packet_information)
                }
                (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_SLI) => {
                    self.handle_sli(state, &block, &mut packet_information)
                }
                (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_RPSI) => {
                    self.handle_rpsi(state, &block, &mut packet_information)
                }
                (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_FIR) => {
                    self.handle_fir(state, &block, &mut packet_information, now)
                }
                (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_PSFB_APP) => {
                    self.handle_psfb_app(state, &block, &mut packet_information)
                }
                _ => {
                    state.num_skipped_packets += 1;
                }
            }
        }

        let now_ms = now.to_millis();
        if state.num_skipped_packets > 0
            && now_ms.saturating_sub(state.last_skipped_packets_warning_ms)
                >= MAX_WARNING_LOG_INTERVAL_MS
        {
            state.last_skipped_packets_warning_ms = now_ms;
            warn!(
                "{} RTCP blocks were skipped due to being malformed or of \
                 unrecognized/unsupported type, during the past {} second period.",
                state.num_skipped_packets,
                MAX_WARNING_LOG_INTERVAL_MS / 1000
            );
        }

        Some(packet_information)
    }

    fn handle_sender_report(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
        now: NtpTime,
    ) {
        let sender_report = match SenderReport::parse(block.payload, block.count_or_format) {
            Some(sender_report) => sender_report,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        let remote_ssrc = sender_report.sender_ssrc;
        packet_information.remote_ssrc = remote_ssrc;

        if state.remote_ssrc == remote_ssrc {
            // Only signal that we have received an SR when we accept one.
            packet_information.add(PacketInformation::SR);
            state.remote_sender_info = RemoteSenderInfo {
                ntp: sender_report.ntp,
                rtp_timestamp: sender_report.rtp_timestamp,
                packet_count: sender_report.packet_count,
                octet_count: sender_report.octet_count,
            };
            state.last_received_sr_ntp = now;
        } else {
            // We only store the send report from one source, but we still
            // harvest all the receive blocks.
            packet_information.add(PacketInformation::RR);
        }

        state
            .receive_info
            .entry(remote_ssrc)
            .or_default()
            .last_time_received_ms = now.to_millis();

        for report_block in &sender_report.report_blocks {
            self.handle_report_block(state, report_block, packet_information, remote_ssrc, now);
        }
    }

    fn handle_receiver_report(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
        now: NtpTime,
    ) {
        let receiver_report = match ReceiverReport::parse(block.payload, block.count_or_format) {
            Some(receiver_report) => receiver_report,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        let remote_ssrc = receiver_report.sender_ssrc;
        packet_information.remote_ssrc = remote_ssrc;
        packet_information.add(PacketInformation::RR);

        state
            .receive_info
            .entry(remote_ssrc)
            .or_default()
            .last_time_received_ms = now.to_millis();

        for report_block in &receiver_report.report_blocks {
            self.handle_report_block(state, report_block, packet_information, remote_ssrc, now);
        }
    }

    fn handle_report_block(
        &self,
        state: &mut State,
        report_block: &ReportBlock,
        packet_information: &mut PacketInformation,
        remote_ssrc: Ssrc,
        now: NtpTime,
    ) {
        // Each report block pertains to one of the sender's sources; filter
        // out the ones that aren't for us.
        if !state.registered_ssrcs.contains(&report_block.source_ssrc) {
            return;
        }

        let main_ssrc = state.main_ssrc;
        let now_ms = now.to_millis();
        state.last_received_rr_ms = now_ms;

        let info = state
            .report_blocks
            .entry(report_block.source_ssrc)
            .or_default()
            .entry(remote_ssrc)
            .or_default();

        // A higher extended sequence number means we delivered new RTP to
        // the remote side since its previous report.
        let sequence_number_increased =
            report_block.extended_high_seq_num > info.received.extended_high_seq_num;

        info.received = ReceivedReportBlock {
            remote_ssrc,
            source_ssrc: report_block.source_ssrc,
            fraction_lost: report_block.fraction_lost,
            cumulative_lost: report_block.cumulative_lost,
            extended_high_seq_num: report_block.extended_high_seq_num,
            jitter: report_block.jitter,
            last_sr: report_block.last_sr,
            delay_since_last_sr: report_block.delay_since_last_sr,
        };
        if report_block.jitter > info.max_jitter {
            info.max_jitter = report_block.jitter;
        }

        // RFC 3550 section 6.4.1: an LSR of zero means the remote hasn't
        // seen an SR from us, so there is nothing to compute RTT from.  A
        // receiver-only endpoint never sends SRs in the first place.
        if !self.receiver_only && report_block.last_sr != 0 {
            let receive_time = now.compact();
            let rtt_ntp = receive_time
                .wrapping_sub(report_block.delay_since_last_sr)
                .wrapping_sub(report_block.last_sr);
            let rtt_ms = compact_ntp_rtt_to_ms(rtt_ntp);

            if rtt_ms > info.stats.max_rtt_ms {
                info.stats.max_rtt_ms = rtt_ms;
            }
            if info.stats.min_rtt_ms == 0 || rtt_ms < info.stats.min_rtt_ms {
                info.stats.min_rtt_ms = rtt_ms;
            }
            info.stats.rtt_ms = rtt_ms;

            if info.rtt_sample_count != 0 {
                let count = info.rtt_sample_count as f64;
                let average = (count / (count + 1.0)) * info.stats.avg_rtt_ms as f64
                    + (1.0 / (count + 1.0)) * rtt_ms as f64;
                info.stats.avg_rtt_ms = (average + 0.5) as u64;
            } else {
                info.stats.avg_rtt_ms = rtt_ms;
            }
            info.rtt_sample_count += 1;
        }

        if report_block.source_ssrc == main_ssrc {
            packet_information.rtt_ms = info.stats.rtt_ms;
        }
        let received = info.received;

        if sequence_number_increased {
            state.last_increased_sequence_number_ms = now_ms;
        }
        packet_information.report_blocks.push(received);
    }

    fn handle_sdes(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        let sdes = match Sdes::parse(block.payload, block.count_or_format) {
            Some(sdes) => sdes,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        for chunk in sdes.chunks {
            if let Some(cname) = chunk.cname {
                state.cnames.insert(chunk.ssrc, cname.clone());
                packet_information.sdes_cnames.push((chunk.ssrc, cname));
            }
        }
        packet_information.add(PacketInformation::SDES);
    }

    fn handle_bye(&self, state: &mut State, block: &RtcpBlock) {
        let bye = match Bye::parse(block.payload, block.count_or_format) {
            Some(bye) => bye,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        for info_map in state.report_blocks.values_mut() {
            info_map.remove(&bye.sender_ssrc);
        }
        // The entry can't be erased yet: the TMMBR bounding set may still
        // need it until the next timer sweep.
        if let Some(info) = state.receive_info.get_mut(&bye.sender_ssrc) {
            info.ready_for_delete = true;
        }
        state.cnames.remove(&bye.sender_ssrc);
        state.xr_rr_rtt_ms = 0;
    }

    fn handle_xr(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
        now: NtpTime,
    ) {
        let xr = match ExtendedReports::parse(block.payload) {
            Some(xr) => xr,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        packet_information.xr_originator_ssrc = xr.sender_ssrc;

        for rrtr in &xr.rrtrs {
            state.remote_xr_receive_time_info = ReceiveTimeInfo {
                ssrc: xr.sender_ssrc,
                last_rr: rrtr.compact(),
                delay_since_last_rr: 0,
            };
            state.last_received_xr_ntp = now;
            packet_information.add(PacketInformation::XR_RECEIVER_REFERENCE_TIME);
        }

        for time_info in &xr.dlrr_time_infos {
            if !state.registered_ssrcs.contains(&time_info.ssrc) {
                // Not to us.
                continue;
            }
            packet_information.xr_dlrr_item = true;
            packet_information.add(PacketInformation::XR_DLRR_REPORT_BLOCK);

            // RTT calculation from extended reports must be explicitly
            // enabled, and an LRR of zero means the remote never saw our
            // RRTR (RFC 3611 section 4.5).
            if !state.xr_rrtr_status || time_info.last_rr == 0 {
                continue;
            }
            let rtt_ntp = now
                .compact()
                .wrapping_sub(time_info.delay_since_last_rr)
                .wrapping_sub(time_info.last_rr);
            state.xr_rr_rtt_ms = compact_ntp_rtt_to_ms(rtt_ntp);
        }
    }

    fn handle_nack(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        let nack = match Nack::parse(block.payload) {
            Some(nack) => nack,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        if self.receiver_only || state.main_ssrc != nack.media_ssrc {
            // Not to us.
            return;
        }

        for seqnum in &nack.seqnums {
            state.nack_stats.report_request(*seqnum);
        }

        if !nack.seqnums.is_empty() {
            packet_information.add(PacketInformation::NACK);
            state.packet_type_counter.nack_packets += 1;
            state.packet_type_counter.nack_requests = state.nack_stats.requests;
            state.packet_type_counter.unique_nack_requests = state.nack_stats.unique_requests;
        }
        packet_information.nack_sequence_numbers = nack.seqnums;
    }

    fn handle_pli(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        let pli = match Pli::parse(block.payload) {
            Some(pli) => pli,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        if state.main_ssrc == pli.media_ssrc {
            state.packet_type_counter.pli_packets += 1;
            // The remote needs a new key frame from us.
            packet_information.add(PacketInformation::PLI);
        }
    }

    fn handle_sli(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        let sli = match Sli::parse(block.payload) {
            Some(sli) => sli,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        for entry in &sli.macroblocks {
            // In theory there could be multiple slices lost; the last one
            // wins.
            packet_information.add(PacketInformation::SLI);
            packet_information.sli_picture_id = entry.picture_id;
        }
    }

    fn handle_rpsi(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        let rpsi = match Rpsi::parse(block.payload) {
            Some(rpsi) => rpsi,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        // The remote confirmed a reference picture.
        packet_information.add(PacketInformation::RPSI);
        packet_information.rpsi_picture_id = rpsi.picture_id;
    }

    fn handle_psfb_app(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        if let Some(remb) = Remb::parse(block.payload) {
            packet_information.add(PacketInformation::REMB);
            packet_information.receiver_estimated_max_bitrate_bps = remb.bitrate_bps;
            return;
        }
        state.num_skipped_packets += 1;
    }

    fn handle_tmmbr(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
        now: NtpTime,
    ) {
        let tmmbr = match Tmmbr::parse(block.payload) {
            Some(tmmbr) => tmmbr,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        let main_ssrc = state.main_ssrc;
        let now_ms = now.to_millis();
        let info = match state.receive_info.get_mut(&tmmbr.sender_ssrc) {
            Some(info) => info,
            // This remote SSRC must be saved before.
            None => return,
        };

        // The media SSRC SHOULD be 0 when it equals the sender SSRC; in
        // relay mode it names the actual requester.
        let requester_ssrc = if tmmbr.media_ssrc != 0 {
            tmmbr.media_ssrc
        } else {
            tmmbr.sender_ssrc
        };

        for request in &tmmbr.requests {
            if main_ssrc == request.ssrc && request.bitrate_bps > 0 {
                info.tmmbr.insert(
                    requester_ssrc,
                    TimedTmmbrItem {
                        item: TmmbItem::new(
                            requester_ssrc,
                            request.bitrate_bps,
                            request.packet_overhead,
                        ),
                        last_updated_ms: now_ms,
                    },
                );
                packet_information.add(PacketInformation::TMMBR);
            }
        }
    }

    fn handle_tmmbn(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        let tmmbn = match Tmmbn::parse(block.payload) {
            Some(tmmbn) => tmmbn,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        let info = match state.receive_info.get_mut(&tmmbn.sender_ssrc) {
            Some(info) => info,
            // This remote SSRC must be saved before.
            None => return,
        };

        packet_information.add(PacketInformation::TMMBN);
        info.tmmbn = tmmbn.items;
    }

    fn handle_sr_request(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        match RapidResyncRequest::parse(block.payload) {
            Some(_) => packet_information.add(PacketInformation::SR_REQ),
            None => state.num_skipped_packets += 1,
        }
    }

    fn handle_fir(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
        now: NtpTime,
    ) {
        let fir = match Fir::parse(block.payload) {
            Some(fir) => fir,
            None => {
                state.num_skipped_packets += 1;
                return;
            }
        };

        let main_ssrc = state.main_ssrc;
        let now_ms = now.to_millis();

        for request in &fir.requests {
            // Is it our sender that is asked for a new key frame?
            if request.ssrc != main_ssrc {
                continue;
            }
            state.packet_type_counter.fir_packets += 1;

            match state.receive_info.get_mut(&fir.sender_ssrc) {
                Some(info) => {
                    // Don't go crazy with the callbacks: a repeat of the
                    // same sequence number within the minimum interval is a
                    // retransmission, not a new request.
                    let debounced = match info.last_fir_sequence_number {
                        Some(last_seq_nr) => {
                            request.seq_nr == last_seq_nr
                                && now_ms.saturating_sub(info.last_fir_request_ms)
                                    <= MIN_FIR_INTERVAL_MS
                        }
                        None => false,
                    };
                    if !debounced {
                        info.last_fir_request_ms = now_ms;
                        info.last_fir_sequence_number = Some(request.seq_nr);
                        packet_information.add(PacketInformation::FIR);
                    }
                }
                None => {
                    // We don't know who this originates from; honor it.
                    packet_information.add(PacketInformation::FIR);
                }
            }
        }
    }

    fn handle_transport_feedback(
        &self,
        state: &mut State,
        block: &RtcpBlock,
        packet_information: &mut PacketInformation,
    ) {
        match transportcc::Feedback::parse(block.payload) {
            Some(feedback) => {
                packet_information.add(PacketInformation::TRANSPORT_FEEDBACK);
                packet_information.transport_feedback = Some(feedback);
            }
            None => state.num_skipped_packets += 1,
        }
    }

    /// Phase 2: fire the callbacks, holding no state lock.
    fn trigger_callbacks(&self, packet_information: PacketInformation, now: NtpTime) {
        let (local_ssrc, registered_ssrcs, packet_type_counter) = {
            let state = self.state.lock();
            (
                state.main_ssrc,
                state.registered_ssrcs.clone(),
                state.packet_type_counter,
            )
        };

        if let Some(observer) = &self.packet_type_counter_observer {
            observer.rtcp_packet_types_counter_updated(local_ssrc, &packet_type_counter);
        }

        // Process TMMBR before the receiver report so a compound packet
        // carrying both produces at most one bandwidth-change callback.
        if packet_information.has(PacketInformation::TMMBR) {
            self.update_tmmbr(now);
        }
        if !self.receiver_only && packet_information.has(PacketInformation::SR_REQ) {
            self.owner.on_request_send_report();
        }
        if !self.receiver_only
            && packet_information.has(PacketInformation::NACK)
            && !packet_information.nack_sequence_numbers.is_empty()
        {
            debug!(
                "Incoming NACK length: {}",
                packet_information.nack_sequence_numbers.len()
            );
            self.owner
                .on_received_nack(&packet_information.nack_sequence_numbers);
        }
        if let Some(observer) = &self.intra_frame_observer {
            if packet_information.has(PacketInformation::PLI | PacketInformation::FIR) {
                debug!(
                    "Incoming intra frame request from SSRC {}",
                    packet_information.remote_ssrc
                );
                observer.on_received_intra_frame_request(local_ssrc);
            }
            if packet_information.has(PacketInformation::SLI) {
                observer.on_received_sli(local_ssrc, packet_information.sli_picture_id);
            }
            if packet_information.has(PacketInformation::RPSI) {
                observer.on_received_rpsi(local_ssrc, packet_information.rpsi_picture_id);
            }
        }
        if let Some(observer) = &self.bandwidth_observer {
            if packet_information.has(PacketInformation::REMB) {
                debug!(
                    "Incoming REMB: {}",
                    packet_information.receiver_estimated_max_bitrate_bps
                );
                observer.on_received_estimated_bitrate(
                    packet_information.receiver_estimated_max_bitrate_bps,
                );
            }
            if packet_information.has(PacketInformation::SR | PacketInformation::RR) {
                observer.on_received_rtcp_receiver_report(
                    &packet_information.report_blocks,
                    packet_information.rtt_ms,
                    now.to_millis(),
                );
            }
        }
        if packet_information.has(PacketInformation::SR | PacketInformation::RR) {
            self.owner
                .on_received_rtcp_report_blocks(&packet_information.report_blocks);
        }
        if let Some(observer) = &self.transport_feedback_observer {
            if let Some(feedback) = &packet_information.transport_feedback {
                if feedback.media_ssrc == local_ssrc
                    || registered_ssrcs.contains(&feedback.media_ssrc)
                {
                    observer.on_transport_feedback(feedback);
                }
            }
        }

        let stats_observer = self.stats_observer.lock();
        if let Some(observer) = &*stats_observer {
            for (ssrc, cname) in &packet_information.sdes_cnames {
                observer.cname_changed(cname, *ssrc);
            }
            if !self.receiver_only {
                for report_block in &packet_information.report_blocks {
                    let statistics = RtcpStatistics {
                        fraction_lost: report_block.fraction_lost,
                        cumulative_lost: report_block.cumulative_lost,
                        extended_max_sequence_number: report_block.extended_high_seq_num,
                        jitter: report_block.jitter,
                    };
                    observer.statistics_updated(statistics, report_block.source_ssrc);
                }
            }
        }
    }
}

fn edge_triggered_timeout(last_ms: &mut u64, rtcp_interval: Duration, now: NtpTime) -> bool {
    if *last_ms == 0 {
        return false;
    }
    let timeout_ms = RR_TIMEOUT_INTERVALS * rtcp_interval.as_millis() as u64;
    if now.to_millis() > *last_ms + timeout_ms {
        // Reset the stamp so this only triggers once.
        *last_ms = 0;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::Writer,
        rtcp::{write_nack, write_remb, write_rtcp, write_tmmbr, write_tmmbn},
    };

    const MAIN_SSRC: Ssrc = 0xAAAA_AAAA;
    const REMOTE_SSRC: Ssrc = 0xBBBB_BBBB;

    #[derive(Default)]
    struct MockOwner {
        tmmbn: Mutex<Vec<Vec<TmmbItem>>>,
        send_report_requests: Mutex<u32>,
        nacks: Mutex<Vec<Vec<u16>>>,
        report_blocks: Mutex<Vec<Vec<ReceivedReportBlock>>>,
    }

    impl RtcpOwner for MockOwner {
        fn set_tmmbn(&self, bounding_set: Vec<TmmbItem>) {
            self.tmmbn.lock().push(bounding_set);
        }
        fn on_request_send_report(&self) {
            *self.send_report_requests.lock() += 1;
        }
        fn on_received_nack(&self, nack_sequence_numbers: &[u16]) {
            self.nacks.lock().push(nack_sequence_numbers.to_vec());
        }
        fn on_received_rtcp_report_blocks(&self, report_blocks: &[ReceivedReportBlock]) {
            self.report_blocks.lock().push(report_blocks.to_vec());
        }
    }

    #[derive(Debug, PartialEq)]
    enum BandwidthEvent {
        EstimatedBitrate(u64),
        ReceiverReport { rtt_ms: u64, block_count: usize },
    }

    #[derive(Default)]
    struct MockBandwidthObserver {
        events: Mutex<Vec<BandwidthEvent>>,
    }

    impl BandwidthObserver for MockBandwidthObserver {
        fn on_received_estimated_bitrate(&self, bitrate_bps: u64) {
            self.events
                .lock()
                .push(BandwidthEvent::EstimatedBitrate(bitrate_bps));
        }
        fn on_received_rtcp_receiver_report(
            &self,
            report_blocks: &[ReceivedReportBlock],
            rtt_ms: u64,
            _now_ms: u64,
        ) {
            self.events.lock().push(BandwidthEvent::ReceiverReport {
                rtt_ms,
                block_count: report_blocks.len(),
            });
        }
    }

    #[derive(Default)]
    struct MockIntraFrameObserver {
        intra_frame_requests: Mutex<Vec<Ssrc>>,
        slis: Mutex<Vec<(Ssrc, u8)>>,
        rpsis: Mutex<Vec<(Ssrc, u64)>>,
        ssrc_changes: Mutex<Vec<(Ssrc, Ssrc)>>,
    }

    impl IntraFrameObserver for MockIntraFrameObserver {
        fn on_received_intra_frame_request(&self, ssrc: Ssrc) {
            self.intra_frame_requests.lock().push(ssrc);
        }
        fn on_received_sli(&self, ssrc: Ssrc, picture_id: u8) {
            self.slis.lock().push((ssrc, picture_id));
        }
        fn on_received_rpsi(&self, ssrc: Ssrc, picture_id: u64) {
            self.rpsis.lock().push((ssrc, picture_id));
        }
        fn on_local_ssrc_changed(&self, old_ssrc: Ssrc, new_ssrc: Ssrc) {
            self.ssrc_changes.lock().push((old_ssrc, new_ssrc));
        }
    }

    #[derive(Default)]
    struct MockTransportFeedbackObserver {
        feedbacks: Mutex<Vec<transportcc::Feedback>>,
    }

    impl TransportFeedbackObserver for MockTransportFeedbackObserver {
        fn on_transport_feedback(&self, feedback: &transportcc::Feedback) {
            self.feedbacks.lock().push(feedback.clone());
        }
    }

    #[derive(Default)]
    struct MockStatisticsObserver {
        statistics: Mutex<Vec<(RtcpStatistics, Ssrc)>>,
        cnames: Mutex<Vec<(String, Ssrc)>>,
    }

    impl StatisticsObserver for MockStatisticsObserver {
        fn statistics_updated(&self, statistics: RtcpStatistics, ssrc: Ssrc) {
            self.statistics.lock().push((statistics, ssrc));
        }
        fn cname_changed(&self, cname: &str, ssrc: Ssrc) {
            self.cnames.lock().push((cname.to_string(), ssrc));
        }
    }

    #[derive(Default)]
    struct MockPacketTypeCounterObserver {
        counters: Mutex<Vec<RtcpPacketTypeCounter>>,
    }

    impl PacketTypeCounterObserver for MockPacketTypeCounterObserver {
        fn rtcp_packet_types_counter_updated(
            &self,
            _ssrc: Ssrc,
            counter: &RtcpPacketTypeCounter,
        ) {
            self.counters.lock().push(*counter);
        }
    }

    struct Fixture {
        receiver: RtcpReceiver,
        owner: Arc<MockOwner>,
        bandwidth: Arc<MockBandwidthObserver>,
        intra_frame: Arc<MockIntraFrameObserver>,
        transport_feedback: Arc<MockTransportFeedbackObserver>,
        statistics: Arc<MockStatisticsObserver>,
        counters: Arc<MockPacketTypeCounterObserver>,
    }

    fn fixture(receiver_only: bool) -> Fixture {
        let owner = Arc::new(MockOwner::default());
        let bandwidth = Arc::new(MockBandwidthObserver::default());
        let intra_frame = Arc::new(MockIntraFrameObserver::default());
        let transport_feedback = Arc::new(MockTransportFeedbackObserver::default());
        let statistics = Arc::new(MockStatisticsObserver::default());
        let counters = Arc::new(MockPacketTypeCounterObserver::default());
        let receiver = RtcpReceiver::new(
            receiver_only,
            Observers {
                packet_type_counter: Some(counters.clone()),
                bandwidth: Some(bandwidth.clone()),
                intra_frame: Some(intra_frame.clone()),
                transport_feedback: Some(transport_feedback.clone()),
            },
            owner.clone(),
        );
        receiver.register_statistics_observer(Some(statistics.clone()));
        receiver.set_ssrcs(MAIN_SSRC, [MAIN_SSRC].into_iter().collect());
        receiver.set_remote_ssrc(REMOTE_SSRC);
        Fixture {
            receiver,
            owner,
            bandwidth,
            intra_frame,
            transport_feedback,
            statistics,
            counters,
        }
    }

    fn report_block_bytes(block: &ReportBlock) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ReportBlock::SIZE);
        bytes.extend_from_slice(&block.source_ssrc.to_be_bytes());
        bytes.push(block.fraction_lost);
        bytes.extend_from_slice(&block.cumulative_lost.to_be_bytes()[1..4]);
        bytes.extend_from_slice(&block.extended_high_seq_num.to_be_bytes());
        bytes.extend_from_slice(&block.jitter.to_be_bytes());
        bytes.extend_from_slice(&block.last_sr.to_be_bytes());
        bytes.extend_from_slice(&block.delay_since_last_sr.to_be_bytes());
        bytes
    }

    fn sr_packet(
        sender_ssrc: Ssrc,
        ntp: NtpTime,
        rtp_timestamp: u32,
        packet_count: u32,
        octet_count: u32,
        report_blocks: &[ReportBlock],
    ) -> Vec<u8> {
        let mut payload = sender_ssrc.to_be_bytes().to_vec();
        payload.extend_from_slice(&ntp.seconds.to_be_bytes());
        payload.extend_from_slice(&ntp.fraction.to_be_bytes());
        payload.extend_from_slice(&rtp_timestamp.to_be_bytes());
        payload.extend_from_slice(&packet_count.to_be_bytes());
        payload.extend_from_slice(&octet_count.to_be_bytes());
        for block in report_blocks {
            payload.extend_from_slice(&report_block_bytes(block));
        }
        write_rtcp(
            RTCP_TYPE_SENDER_REPORT,
            report_blocks.len() as u8,
            &payload,
        )
    }

    fn rr_packet(sender_ssrc: Ssrc, report_blocks: &[ReportBlock]) -> Vec<u8> {
        let mut payload = sender_ssrc.to_be_bytes().to_vec();
        for block in report_blocks {
            payload.extend_from_slice(&report_block_bytes(block));
        }
        write_rtcp(
            RTCP_TYPE_RECEIVER_REPORT,
            report_blocks.len() as u8,
            &payload,
        )
    }

    fn sdes_packet(ssrc: Ssrc, cname: &str) -> Vec<u8> {
        let mut payload = ssrc.to_be_bytes().to_vec();
        payload.push(1); // CNAME
        payload.push(cname.len() as u8);
        payload.extend_from_slice(cname.as_bytes());
        payload.push(0);
        while payload.len() % 4 != 0 {
            payload.push(0);
        }
        write_rtcp(RTCP_TYPE_SDES, 1, &payload)
    }

    fn bye_packet(ssrc: Ssrc) -> Vec<u8> {
        write_rtcp(RTCP_TYPE_BYE, 1, &ssrc.to_be_bytes())
    }

    fn pli_packet(sender_ssrc: Ssrc, media_ssrc: Ssrc) -> Vec<u8> {
        write_rtcp(
            RTCP_TYPE_SPECIFIC_FEEDBACK,
            RTCP_FORMAT_PLI,
            &(sender_ssrc, media_ssrc),
        )
    }

    fn fir_packet(sender_ssrc: Ssrc, target_ssrc: Ssrc, seq_nr: u8) -> Vec<u8> {
        write_rtcp(
            RTCP_TYPE_SPECIFIC_FEEDBACK,
            RTCP_FORMAT_FIR,
            &(sender_ssrc, 0u32, target_ssrc, [seq_nr, 0, 0, 0]),
        )
    }

    fn xr_packet(
        sender_ssrc: Ssrc,
        rrtr: Option<NtpTime>,
        dlrr_time_infos: &[ReceiveTimeInfo],
    ) -> Vec<u8> {
        let mut payload = sender_ssrc.to_be_bytes().to_vec();
        if let Some(ntp) = rrtr {
            payload.extend_from_slice(&[4, 0, 0, 2]);
            payload.extend_from_slice(&ntp.seconds.to_be_bytes());
            payload.extend_from_slice(&ntp.fraction.to_be_bytes());
        }
        if !dlrr_time_infos.is_empty() {
            payload.extend_from_slice(&[5, 0]);
            payload.extend_from_slice(&((dlrr_time_infos.len() as u16) * 3).to_be_bytes());
            for time_info in dlrr_time_infos {
                payload.extend_from_slice(&time_info.ssrc.to_be_bytes());
                payload.extend_from_slice(&time_info.last_rr.to_be_bytes());
                payload.extend_from_slice(&time_info.delay_since_last_rr.to_be_bytes());
            }
        }
        write_rtcp(RTCP_TYPE_EXTENDED_REPORT, 0, &payload)
    }

    fn transport_feedback_packet(media_ssrc: Ssrc) -> Vec<u8> {
        let mut payload = 0u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&media_ssrc.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes()); // base seqnum
        payload.extend_from_slice(&1u16.to_be_bytes()); // status count
        payload.extend_from_slice(&[0, 0, 4, 0]); // reference time, feedback seqnum
        let chunk: u16 = (0b01 << 13) | 1; // run of 1 small delta
        payload.extend_from_slice(&chunk.to_be_bytes());
        payload.push(4); // delta
        payload.push(0); // padding to the word boundary
        write_rtcp(RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_TRANSPORT_CC, &payload)
    }

    fn at_ms(millis: u64) -> NtpTime {
        NtpTime::from_millis(millis)
    }

    #[test]
    fn test_empty_packet_is_rejected() {
        let fixture = fixture(false);
        assert_eq!(
            Err(Error::ReceivedEmptyRtcp),
            fixture.receiver.incoming_packet(&[], at_ms(1000))
        );
        assert_eq!(0, fixture.receiver.num_skipped_packets());
        assert!(fixture.receiver.statistics_received().is_empty());
    }

    #[test]
    fn test_invalid_first_block_rejects_datagram() {
        let fixture = fixture(false);
        // Wrong version in the first header.
        assert_eq!(
            Err(Error::ReceivedInvalidRtcp),
            fixture
                .receiver
                .incoming_packet(&[0x40, 200, 0, 0], at_ms(1000))
        );
        assert_eq!(0, fixture.receiver.num_skipped_packets());
    }

    #[test]
    fn test_invalid_later_block_keeps_extracted_state() {
        let fixture = fixture(false);
        let block = ReportBlock {
            source_ssrc: MAIN_SSRC,
            ..Default::default()
        };
        let mut packet = rr_packet(REMOTE_SSRC, &[block]);
        // A second block that declares more payload than remains.
        packet.extend_from_slice(&[0x80, 200, 0, 5]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(1, fixture.receiver.num_skipped_packets());
        assert_eq!(1, fixture.receiver.statistics_received().len());
    }

    #[test]
    fn test_unknown_packet_type_is_skipped() {
        let fixture = fixture(false);
        let packet = write_rtcp(210, 0, &0u32.to_be_bytes());
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(1, fixture.receiver.num_skipped_packets());

        // Unknown feedback formats are skipped too.
        let packet = write_rtcp(RTCP_TYPE_GENERIC_FEEDBACK, 9, &(0u32, 0u32));
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(2, fixture.receiver.num_skipped_packets());
    }

    #[test]
    fn test_sender_report_computes_rtt() {
        let fixture = fixture(false);
        let block = ReportBlock {
            source_ssrc: MAIN_SSRC,
            fraction_lost: 5,
            cumulative_lost: 42,
            extended_high_seq_num: 12345,
            jitter: 7,
            last_sr: 0x8000_0000,
            delay_since_last_sr: 0x0001_0000, // 1 s
        };
        let now = NtpTime::new(1, 0); // compact 0x00010000
        let packet = sr_packet(
            REMOTE_SSRC,
            NtpTime::new(3_000_000, 0),
            160_000,
            100,
            16_000,
            &[block],
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));

        // now - dlsr - lsr wraps to 0x8000_0000 which is 32768000 ms.
        let expected_rtt_ms = 32_768_000;
        assert_eq!(
            Some(RttStats {
                rtt_ms: expected_rtt_ms,
                avg_rtt_ms: expected_rtt_ms,
                min_rtt_ms: expected_rtt_ms,
                max_rtt_ms: expected_rtt_ms,
            }),
            fixture.receiver.rtt(REMOTE_SSRC)
        );

        let sender_info = fixture.receiver.sender_info().unwrap();
        assert_eq!(NtpTime::new(3_000_000, 0), sender_info.ntp);
        assert_eq!(160_000, sender_info.rtp_timestamp);
        assert_eq!(100, sender_info.packet_count);
        assert_eq!(16_000, sender_info.octet_count);
        assert_eq!(
            Some(NtpInfo {
                remote_ntp: NtpTime::new(3_000_000, 0),
                arrival_ntp: now,
                rtp_timestamp: 160_000,
            }),
            fixture.receiver.ntp()
        );

        assert_eq!(
            vec![BandwidthEvent::ReceiverReport {
                rtt_ms: expected_rtt_ms,
                block_count: 1
            }],
            *fixture.bandwidth.events.lock()
        );
        let owner_blocks = fixture.owner.report_blocks.lock();
        assert_eq!(1, owner_blocks.len());
        assert_eq!(42, owner_blocks[0][0].cumulative_lost);
        assert_eq!(
            vec![(
                RtcpStatistics {
                    fraction_lost: 5,
                    cumulative_lost: 42,
                    extended_max_sequence_number: 12345,
                    jitter: 7,
                },
                MAIN_SSRC
            )],
            *fixture.statistics.statistics.lock()
        );
    }

    #[test]
    fn test_sr_from_other_sender_counts_as_rr() {
        let fixture = fixture(false);
        let packet = sr_packet(0xDDDD_DDDD, NtpTime::new(99, 0), 0, 1, 1, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        // No sender info is stored for a non-designated sender...
        assert_eq!(None, fixture.receiver.sender_info());
        // ...but its report is still dispatched as an RR.
        assert_eq!(
            vec![BandwidthEvent::ReceiverReport {
                rtt_ms: 0,
                block_count: 0
            }],
            *fixture.bandwidth.events.lock()
        );
    }

    #[test]
    fn test_two_receiver_reports_update_running_mean() {
        let fixture = fixture(false);
        let now = NtpTime::new(0x1234, 0); // compact 0x12340000

        // rtt_ntp = 0x199A = 100 ms.
        let block = ReportBlock {
            source_ssrc: MAIN_SSRC,
            last_sr: 0x1234_0000 - 0x199A,
            ..Default::default()
        };
        let packet = rr_packet(REMOTE_SSRC, &[block]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));

        // rtt_ntp = 0x4CCD = 300 ms.
        let block = ReportBlock {
            source_ssrc: MAIN_SSRC,
            last_sr: 0x1234_0000 - 0x4CCD,
            ..Default::default()
        };
        let packet = rr_packet(REMOTE_SSRC, &[block]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));

        assert_eq!(
            Some(RttStats {
                rtt_ms: 300,
                avg_rtt_ms: 200,
                min_rtt_ms: 100,
                max_rtt_ms: 300,
            }),
            fixture.receiver.rtt(REMOTE_SSRC)
        );
    }

    #[test]
    fn test_receiver_only_mode_computes_no_rtt() {
        let fixture = fixture(true);
        let block = ReportBlock {
            source_ssrc: MAIN_SSRC,
            last_sr: 0x1000_0000,
            delay_since_last_sr: 1,
            ..Default::default()
        };
        let packet = rr_packet(REMOTE_SSRC, &[block]);
        assert_eq!(
            Ok(()),
            fixture
                .receiver
                .incoming_packet(&packet, NtpTime::new(0x1001, 0))
        );
        assert_eq!(
            Some(RttStats::default()),
            fixture.receiver.rtt(REMOTE_SSRC)
        );
        // No statistics callback in receiver-only mode.
        assert!(fixture.statistics.statistics.lock().is_empty());
    }

    #[test]
    fn test_report_blocks_for_unknown_sources_are_dropped() {
        let fixture = fixture(false);
        let block = ReportBlock {
            source_ssrc: 0x5555_5555, // not registered
            ..Default::default()
        };
        let packet = rr_packet(REMOTE_SSRC, &[block]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert!(fixture.receiver.statistics_received().is_empty());
        assert_eq!(None, fixture.receiver.rtt(REMOTE_SSRC));
    }

    #[test]
    fn test_rr_with_31_report_blocks() {
        let fixture = fixture(false);
        let blocks: Vec<ReportBlock> = (0..31)
            .map(|extended_high_seq_num| ReportBlock {
                source_ssrc: MAIN_SSRC,
                extended_high_seq_num,
                ..Default::default()
            })
            .collect();
        let packet = rr_packet(REMOTE_SSRC, &blocks);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        let owner_blocks = fixture.owner.report_blocks.lock();
        assert_eq!(31, owner_blocks[0].len());
    }

    #[test]
    fn test_replayed_sender_report_is_idempotent() {
        let fixture = fixture(false);
        let packet = sr_packet(REMOTE_SSRC, NtpTime::new(42, 7), 1000, 10, 100, &[]);
        let now = at_ms(5000);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));
        let first = fixture.receiver.sender_info();
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));
        assert_eq!(first, fixture.receiver.sender_info());
        assert_eq!(Some(now), fixture.receiver.ntp().map(|info| info.arrival_ntp));
    }

    #[test]
    fn test_set_remote_ssrc_resets_sender_info() {
        let fixture = fixture(false);
        let packet = sr_packet(REMOTE_SSRC, NtpTime::new(42, 7), 1000, 10, 100, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(5000)));
        assert!(fixture.receiver.sender_info().is_some());

        fixture.receiver.set_remote_ssrc(0xCCCC_CCCC);
        assert_eq!(0xCCCC_CCCC, fixture.receiver.remote_ssrc());
        assert_eq!(None, fixture.receiver.sender_info());
        assert_eq!(None, fixture.receiver.ntp());
    }

    #[test]
    fn test_nack_dispatch() {
        let fixture = fixture(false);
        let packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_NACK,
            &write_nack(REMOTE_SSRC, MAIN_SSRC, [10u16, 12].iter().copied()).to_vec(),
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(vec![vec![10, 12]], *fixture.owner.nacks.lock());
        let counter = *fixture.counters.counters.lock().last().unwrap();
        assert_eq!(1, counter.nack_packets);
        assert_eq!(2, counter.nack_requests);
        assert_eq!(2, counter.unique_nack_requests);

        // A repeat of the same seqnums counts requests but not unique ones.
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1100)));
        let counter = *fixture.counters.counters.lock().last().unwrap();
        assert_eq!(2, counter.nack_packets);
        assert_eq!(4, counter.nack_requests);
        assert_eq!(2, counter.unique_nack_requests);
    }

    #[test]
    fn test_nack_not_addressed_to_us_is_dropped() {
        let main_fixture = fixture(false);
        let packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_NACK,
            &write_nack(REMOTE_SSRC, 0x5555_5555, [10u16].iter().copied()).to_vec(),
        );
        assert_eq!(Ok(()), main_fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert!(main_fixture.owner.nacks.lock().is_empty());

        // Receiver-only endpoints don't retransmit, so NACKs are dropped.
        let receiver_only = fixture(true);
        let packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_NACK,
            &write_nack(REMOTE_SSRC, MAIN_SSRC, [10u16].iter().copied()).to_vec(),
        );
        assert_eq!(
            Ok(()),
            receiver_only.receiver.incoming_packet(&packet, at_ms(1000))
        );
        assert!(receiver_only.owner.nacks.lock().is_empty());
    }

    #[test]
    fn test_pli_dispatch() {
        let fixture = fixture(false);
        let packet = pli_packet(REMOTE_SSRC, MAIN_SSRC);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(vec![MAIN_SSRC], *fixture.intra_frame.intra_frame_requests.lock());
        assert_eq!(1, fixture.counters.counters.lock().last().unwrap().pli_packets);

        // A PLI for someone else is dropped.
        let packet = pli_packet(REMOTE_SSRC, 0x5555_5555);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(1, fixture.intra_frame.intra_frame_requests.lock().len());
    }

    #[test]
    fn test_fir_debounce() {
        let fixture = fixture(false);
        // An RR first, so the sender is known and debouncing applies.
        let packet = rr_packet(2, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));

        let packet = fir_packet(2, MAIN_SSRC, 7);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(1, fixture.intra_frame.intra_frame_requests.lock().len());

        // The same sequence number within the minimum interval is debounced.
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1050)));
        assert_eq!(1, fixture.intra_frame.intra_frame_requests.lock().len());

        // A new sequence number is honored immediately.
        let packet = fir_packet(2, MAIN_SSRC, 8);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1060)));
        assert_eq!(2, fixture.intra_frame.intra_frame_requests.lock().len());

        // The counter saw all three matching requests.
        assert_eq!(3, fixture.counters.counters.lock().last().unwrap().fir_packets);
    }

    #[test]
    fn test_fir_from_unknown_sender_is_honored() {
        let fixture = fixture(false);
        let packet = fir_packet(9, MAIN_SSRC, 1);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1001)));
        assert_eq!(2, fixture.intra_frame.intra_frame_requests.lock().len());

        // A FIR for another target is ignored entirely.
        let packet = fir_packet(9, 0x5555_5555, 2);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1002)));
        assert_eq!(2, fixture.intra_frame.intra_frame_requests.lock().len());
    }

    #[test]
    fn test_sli_and_rpsi_dispatch() {
        let fixture = fixture(false);
        let bits: u32 = (3 << 19) | (2 << 6) | 37;
        let packet = write_rtcp(
            RTCP_TYPE_SPECIFIC_FEEDBACK,
            RTCP_FORMAT_SLI,
            &(REMOTE_SSRC, MAIN_SSRC, bits),
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(vec![(MAIN_SSRC, 37)], *fixture.intra_frame.slis.lock());

        let packet = write_rtcp(
            RTCP_TYPE_SPECIFIC_FEEDBACK,
            RTCP_FORMAT_RPSI,
            &(REMOTE_SSRC, MAIN_SSRC, [0u8, 108, 0x85, 0x03]),
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(
            vec![(MAIN_SSRC, (0x05 << 7) | 0x03)],
            *fixture.intra_frame.rpsis.lock()
        );
    }

    #[test]
    fn test_sdes_stores_cname_and_notifies() {
        let fixture = fixture(false);
        let packet = sdes_packet(REMOTE_SSRC, "alice@example");
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(
            Some("alice@example".to_string()),
            fixture.receiver.cname(REMOTE_SSRC)
        );
        assert_eq!(
            vec![("alice@example".to_string(), REMOTE_SSRC)],
            *fixture.statistics.cnames.lock()
        );
    }

    #[test]
    fn test_bye_tombstones_sender() {
        let fixture = fixture(false);
        let block = ReportBlock {
            source_ssrc: MAIN_SSRC,
            ..Default::default()
        };
        let packet = rr_packet(REMOTE_SSRC, &[block]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        let packet = sdes_packet(REMOTE_SSRC, "alice");
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(1, fixture.receiver.statistics_received().len());

        let packet = bye_packet(REMOTE_SSRC);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(2000)));

        // The CNAME and the report blocks are gone immediately.
        assert_eq!(None, fixture.receiver.cname(REMOTE_SSRC));
        assert!(fixture.receiver.statistics_received().is_empty());
        // The receive information is tombstoned, not erased.
        assert!(fixture.receiver.last_received_receiver_report_ms().is_some());

        // The next sweep erases it.
        assert!(!fixture.receiver.update_receive_information_timers(at_ms(2100)));
        assert_eq!(None, fixture.receiver.last_received_receiver_report_ms());

        // A new report from the same sender recreates the entry.
        let packet = rr_packet(REMOTE_SSRC, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(3000)));
        assert_eq!(
            Some(3000),
            fixture.receiver.last_received_receiver_report_ms()
        );
    }

    #[test]
    fn test_rr_timeout_is_single_shot() {
        let fixture = fixture(false);
        let interval = Duration::from_millis(1000);

        // No RR yet: no timeout.
        assert!(!fixture.receiver.rtcp_rr_timeout(interval, at_ms(100_000)));

        let block = ReportBlock {
            source_ssrc: MAIN_SSRC,
            extended_high_seq_num: 10,
            ..Default::default()
        };
        let packet = rr_packet(REMOTE_SSRC, &[block]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(10_000)));

        assert!(!fixture.receiver.rtcp_rr_timeout(interval, at_ms(13_000)));
        assert!(fixture.receiver.rtcp_rr_timeout(interval, at_ms(13_001)));
        // Only fires once.
        assert!(!fixture.receiver.rtcp_rr_timeout(interval, at_ms(20_000)));

        // A fresh RR rearms it.
        let block = ReportBlock {
            source_ssrc: MAIN_SSRC,
            extended_high_seq_num: 20,
            ..Default::default()
        };
        let packet = rr_packet(REMOTE_SSRC, &[block]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(14_000)));
        assert!(fixture.receiver.rtcp_rr_timeout(interval, at_ms(17_001)));

        // The sequence-number timeout behaves the same way; the second RR
        // increased the sequence number at 14s.
        assert!(fixture
            .receiver
            .rtcp_rr_sequence_number_timeout(interval, at_ms(17_001)));
        assert!(!fixture
            .receiver
            .rtcp_rr_sequence_number_timeout(interval, at_ms(17_002)));
    }

    #[test]
    fn test_xr_rrtr_is_stored_for_echo() {
        let fixture = fixture(false);
        let rrtr = NtpTime::new(0x1122_3344, 0x5566_7788);
        let packet = xr_packet(0xEEEE_EEEE, Some(rrtr), &[]);
        let arrival = NtpTime::new(0x100, 0);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, arrival));

        // Half a second later the delay is half a second, in compact units.
        let info = fixture
            .receiver
            .last_received_xr_reference_time_info(NtpTime::new(0x100, 0x8000_0000))
            .unwrap();
        assert_eq!(0xEEEE_EEEE, info.ssrc);
        assert_eq!(rrtr.compact(), info.last_rr);
        assert_eq!(0x8000, info.delay_since_last_rr);
    }

    #[test]
    fn test_xr_dlrr_computes_one_shot_rtt() {
        let fixture = fixture(false);
        fixture.receiver.set_rtcp_xr_rrtr_status(true);
        let time_info = ReceiveTimeInfo {
            ssrc: MAIN_SSRC,
            last_rr: 0x04FF_0000,
            delay_since_last_rr: 0x8000, // 0.5 s
        };
        let now = NtpTime::new(0x500, 0); // compact 0x05000000
        let packet = xr_packet(0xEEEE_EEEE, None, &[time_info]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));

        // rtt_ntp = 0x05000000 - 0x8000 - 0x04FF0000 = 0x8000 = 500 ms.
        assert_eq!(Some(500), fixture.receiver.get_and_reset_xr_rr_rtt());
        // It's a one-shot.
        assert_eq!(None, fixture.receiver.get_and_reset_xr_rr_rtt());
    }

    #[test]
    fn test_xr_dlrr_needs_rrtr_status_and_a_last_rr() {
        let fixture = fixture(false);
        let now = NtpTime::new(0x500, 0);

        // Status disabled: no RTT.
        let time_info = ReceiveTimeInfo {
            ssrc: MAIN_SSRC,
            last_rr: 0x04FF_0000,
            delay_since_last_rr: 0x8000,
        };
        let packet = xr_packet(0xEEEE_EEEE, None, &[time_info]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));
        assert_eq!(None, fixture.receiver.get_and_reset_xr_rr_rtt());

        fixture.receiver.set_rtcp_xr_rrtr_status(true);

        // A zero last_rr means the remote never saw our RRTR.
        let time_info = ReceiveTimeInfo {
            ssrc: MAIN_SSRC,
            last_rr: 0,
            delay_since_last_rr: 0x8000,
        };
        let packet = xr_packet(0xEEEE_EEEE, None, &[time_info]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));
        assert_eq!(None, fixture.receiver.get_and_reset_xr_rr_rtt());

        // A DLRR for a foreign SSRC is not for us.
        let time_info = ReceiveTimeInfo {
            ssrc: 0x5555_5555,
            last_rr: 0x04FF_0000,
            delay_since_last_rr: 0x8000,
        };
        let packet = xr_packet(0xEEEE_EEEE, None, &[time_info]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, now));
        assert_eq!(None, fixture.receiver.get_and_reset_xr_rr_rtt());
    }

    #[test]
    fn test_remb_dispatch() {
        let fixture = fixture(false);
        let packet = write_rtcp(
            RTCP_TYPE_SPECIFIC_FEEDBACK,
            RTCP_FORMAT_PSFB_APP,
            &write_remb(REMOTE_SSRC, 500_000, &[MAIN_SSRC]).to_vec(),
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(
            vec![BandwidthEvent::EstimatedBitrate(500_000)],
            *fixture.bandwidth.events.lock()
        );
    }

    #[test]
    fn test_tmmbr_flows_into_bounding_set() {
        let fixture = fixture(false);
        // TMMBR from an unknown sender is dropped.
        let request = TmmbItem::new(MAIN_SSRC, 30_000, 40);
        let packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_TMMBR,
            &write_tmmbr(REMOTE_SSRC, 0, &[request]).to_vec(),
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert!(fixture.owner.tmmbn.lock().is_empty());

        // After an RR the sender is known and the request is accepted.
        let rr = rr_packet(REMOTE_SSRC, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&rr, at_ms(1000)));
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));

        let expected = TmmbItem::new(REMOTE_SSRC, 30_000, 40);
        assert_eq!(vec![expected], fixture.receiver.tmmbr_received(at_ms(1000)));
        // The dispatcher ran update_tmmbr: the owner got the bounding set
        // and the bandwidth observer the minimum bitrate.
        assert_eq!(vec![vec![expected]], *fixture.owner.tmmbn.lock());
        assert!(fixture
            .bandwidth
            .events
            .lock()
            .contains(&BandwidthEvent::EstimatedBitrate(30_000)));

        // After five silent intervals the sweep drops the limit.
        assert!(fixture
            .receiver
            .update_receive_information_timers(at_ms(1000 + 25_001)));
        assert!(fixture.receiver.tmmbr_received(at_ms(1000 + 25_001)).is_empty());
        // And only fires once.
        assert!(!fixture
            .receiver
            .update_receive_information_timers(at_ms(1000 + 26_000)));
    }

    #[test]
    fn test_tmmbr_with_zero_bitrate_is_ignored() {
        let fixture = fixture(false);
        let rr = rr_packet(REMOTE_SSRC, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&rr, at_ms(1000)));
        let packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_TMMBR,
            &write_tmmbr(REMOTE_SSRC, 0, &[TmmbItem::new(MAIN_SSRC, 0, 40)]).to_vec(),
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert!(fixture.receiver.tmmbr_received(at_ms(1000)).is_empty());
        assert!(fixture.owner.tmmbn.lock().is_empty());
    }

    #[test]
    fn test_tmmbn_is_stored_for_the_bounding_set_query() {
        let fixture = fixture(false);
        let rr = rr_packet(REMOTE_SSRC, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&rr, at_ms(1000)));

        let items = vec![
            TmmbItem::new(MAIN_SSRC, 40_000, 40),
            TmmbItem::new(7, 80_000, 60),
        ];
        let packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_TMMBN,
            &write_tmmbn(REMOTE_SSRC, &items).to_vec(),
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!((items, true), fixture.receiver.bounding_set());

        // A later notification replaces the list.
        let items = vec![TmmbItem::new(7, 80_000, 60)];
        let packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_TMMBN,
            &write_tmmbn(REMOTE_SSRC, &items).to_vec(),
        );
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1100)));
        assert_eq!((items, false), fixture.receiver.bounding_set());
    }

    #[test]
    fn test_rapid_resync_request_dispatch() {
        let main_fixture = fixture(false);
        let packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_SR_REQ,
            &(REMOTE_SSRC, MAIN_SSRC),
        );
        assert_eq!(Ok(()), main_fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(1, *main_fixture.owner.send_report_requests.lock());

        // Receiver-only endpoints don't send reports.
        let receiver_only = fixture(true);
        assert_eq!(
            Ok(()),
            receiver_only.receiver.incoming_packet(&packet, at_ms(1000))
        );
        assert_eq!(0, *receiver_only.owner.send_report_requests.lock());
    }

    #[test]
    fn test_transport_feedback_is_filtered_by_media_ssrc() {
        let fixture = fixture(false);
        let packet = transport_feedback_packet(MAIN_SSRC);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(1, fixture.transport_feedback.feedbacks.lock().len());
        assert_eq!(
            MAIN_SSRC,
            fixture.transport_feedback.feedbacks.lock()[0].media_ssrc
        );

        // Feedback about someone else's media is not forwarded.
        let packet = transport_feedback_packet(0x5555_5555);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1000)));
        assert_eq!(1, fixture.transport_feedback.feedbacks.lock().len());
    }

    #[test]
    fn test_tmmbr_bandwidth_update_precedes_receiver_report() {
        let fixture = fixture(false);
        let rr = rr_packet(REMOTE_SSRC, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&rr, at_ms(1000)));

        // One compound datagram with both a TMMBR and an RR.
        let mut packet = write_rtcp(
            RTCP_TYPE_GENERIC_FEEDBACK,
            RTCP_FORMAT_TMMBR,
            &write_tmmbr(REMOTE_SSRC, 0, &[TmmbItem::new(MAIN_SSRC, 30_000, 40)]).to_vec(),
        );
        packet.extend_from_slice(&rr_packet(REMOTE_SSRC, &[]));
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(1001)));

        let events = fixture.bandwidth.events.lock();
        let last_two = &events[events.len() - 2..];
        assert_eq!(BandwidthEvent::EstimatedBitrate(30_000), last_two[0]);
        assert!(matches!(last_two[1], BandwidthEvent::ReceiverReport { .. }));
    }

    #[test]
    fn test_set_ssrcs_notifies_local_ssrc_change() {
        let fixture = fixture(false);
        // The fixture already switched from 0 to MAIN_SSRC.
        assert_eq!(vec![(0, MAIN_SSRC)], *fixture.intra_frame.ssrc_changes.lock());

        fixture
            .receiver
            .set_ssrcs(0x1111_1111, [0x1111_1111].into_iter().collect());
        assert_eq!(
            vec![(0, MAIN_SSRC), (MAIN_SSRC, 0x1111_1111)],
            *fixture.intra_frame.ssrc_changes.lock()
        );

        // No notification when the main SSRC is unchanged.
        fixture
            .receiver
            .set_ssrcs(0x1111_1111, [0x1111_1111, 0x2222_2222].into_iter().collect());
        assert_eq!(2, fixture.intra_frame.ssrc_changes.lock().len());
    }

    #[test]
    fn test_first_packet_time_is_recorded_once() {
        let fixture = fixture(false);
        let packet = rr_packet(REMOTE_SSRC, &[]);
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(7000)));
        assert_eq!(Ok(()), fixture.receiver.incoming_packet(&packet, at_ms(9000)));
        let counter = *fixture.counters.counters.lock().last().unwrap();
        assert_eq!(Some(7000), counter.first_packet_time_ms);
    }

    #[test]
    fn test_nack_stats_sequence_numbers() {
        let mut stats = NackStats::default();
        stats.report_request(100);
        stats.report_request(100);
        stats.report_request(101);
        // An older number is not unique.
        stats.report_request(50);
        assert_eq!(4, stats.requests);
        assert_eq!(2, stats.unique_requests);

        // A wraparound to a newer number is unique.
        let mut stats = NackStats::default();
        stats.report_request(0xFFFE);
        stats.report_request(2);
        stats.report_request(0xFFFF);
        assert_eq!(3, stats.requests);
        assert_eq!(2, stats.unique_requests);
    }
}
