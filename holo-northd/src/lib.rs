//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod addresses;
pub mod allocator;
pub mod datapath;
pub mod debug;
pub mod engine;
pub mod error;
pub mod ha;
pub mod ipam;
pub mod lflow;
pub mod multicast;
pub mod nb;
pub mod port;
pub mod rbac;
pub mod sb;
pub mod sync;
