//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common functionality for the RTCP wire parsers and the receive pipeline.

mod bits;
mod serialize;

use std::convert::TryInto;

pub use bits::*;
pub use serialize::*;

pub fn parse_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes(bytes[0..2].try_into().unwrap())
}

pub fn parse_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes[0..4].try_into().unwrap())
}

/// Splits `len` bytes off the front of the reader, advancing it in place
/// the way the `byteorder` reads do.
pub fn take_bytes<'a>(reader: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if reader.len() < len {
        return None;
    }
    let (taken, rest) = reader.split_at(len);
    *reader = rest;
    Some(taken)
}

pub trait CheckedSplitAt {
    fn checked_split_at(&self, mid: usize) -> Option<(&[u8], &[u8])>;
}

impl CheckedSplitAt for [u8] {
    fn checked_split_at(&self, mid: usize) -> Option<(&[u8], &[u8])> {
        if self.len() < mid {
            None
        } else {
            Some(self.split_at(mid))
        }
    }
}
