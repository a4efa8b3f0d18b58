//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Temporary Maximum Media Bitrate (TMMBR/TMMBN) items and the bounding-set
//! algorithm of https://tools.ietf.org/html/rfc5104#section-3.5.4.2

use crate::rtcp::Ssrc;

/// One TMMBR/TMMBN tuple: who is limiting, to what bitrate, assuming which
/// per-packet overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmmbItem {
    pub ssrc: Ssrc,
    pub bitrate_bps: u64,
    pub packet_overhead: u16,
}

impl TmmbItem {
    pub fn new(ssrc: Ssrc, bitrate_bps: u64, packet_overhead: u16) -> Self {
        Self {
            ssrc,
            bitrate_bps,
            packet_overhead,
        }
    }
}

/// Each tuple constrains the media bitrate b at packet rate r to
/// b <= bitrate - 8 * overhead * r.  The bounding set is the subset of
/// tuples forming the lower envelope of those lines for r >= 0.
pub fn find_bounding_set(mut candidates: Vec<TmmbItem>) -> Vec<TmmbItem> {
    candidates.retain(|item| item.bitrate_bps > 0);
    if candidates.len() <= 1 {
        return candidates;
    }

    // Sort by increasing overhead; of tuples with the same overhead only the
    // one with the lowest bitrate can bound.
    candidates.sort_by_key(|item| (item.packet_overhead, item.bitrate_bps));
    candidates.dedup_by(|next, kept| next.packet_overhead == kept.packet_overhead);

    // The first member is the tuple with the lowest bitrate (the lowest line
    // at r = 0).  Of equal bitrates the one with the highest overhead wins,
    // since the steeper line stays below from there on.  Everything with a
    // lower overhead than the first member can never bound.
    let mut first_index = 0;
    for (index, candidate) in candidates.iter().enumerate() {
        if candidate.bitrate_bps <= candidates[first_index].bitrate_bps {
            first_index = index;
        }
    }

    let first = candidates[first_index];
    let mut bounding = vec![first];
    // The packet rate at which each bounding tuple takes over from the one
    // before it, and the packet rate at which its own line reaches zero.
    let mut intersections = vec![0.0f64];
    let mut max_packet_rates = vec![max_packet_rate(&first)];

    for candidate in &candidates[first_index + 1..] {
        loop {
            let last = bounding[bounding.len() - 1];
            // May be negative when the candidate is cheaper than the last
            // member everywhere.
            let packet_rate = (candidate.bitrate_bps as f64 - last.bitrate_bps as f64)
                / (8.0 * (candidate.packet_overhead - last.packet_overhead) as f64);
            if bounding.len() > 1 && packet_rate <= intersections[intersections.len() - 1] {
                // The candidate overtakes the last member before the last
                // member ever bounds; drop it and compare again.
                bounding.pop();
                intersections.pop();
                max_packet_rates.pop();
                continue;
            }
            if packet_rate < max_packet_rates[max_packet_rates.len() - 1] {
                bounding.push(*candidate);
                intersections.push(packet_rate);
                max_packet_rates.push(max_packet_rate(candidate));
            }
            break;
        }
    }
    bounding
}

fn max_packet_rate(item: &TmmbItem) -> f64 {
    if item.packet_overhead == 0 {
        f64::MAX
    } else {
        item.bitrate_bps as f64 / (8.0 * item.packet_overhead as f64)
    }
}

pub fn calc_min_bitrate_bps(bounding_set: &[TmmbItem]) -> Option<u64> {
    bounding_set.iter().map(|item| item.bitrate_bps).min()
}

/// Whether the given SSRC is named by the bounding set, i.e. one of its own
/// requests is among the active restrictions.
pub fn is_owner(bounding_set: &[TmmbItem], ssrc: Ssrc) -> bool {
    bounding_set.iter().any(|item| item.ssrc == ssrc)
}
