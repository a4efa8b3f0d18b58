//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub mod common;
pub mod ntp;
pub mod receiver;
pub mod rtcp;
pub mod tmmbr;
pub mod transportcc;
