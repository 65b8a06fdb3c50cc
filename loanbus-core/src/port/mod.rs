// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Publisher and subscriber ports.
//!
//! Port state lives in the segment's port table so that a surviving process
//! can reclaim the ports of one that died.

mod publisher;
mod subscriber;
mod table;

pub use publisher::{Loan, PublishChunk, PublishReport, Publisher, PublisherOptions};
pub use subscriber::{Sample, Subscriber, SubscriberOptions};
pub use table::{
    ClaimedPort, PortSlotHeader, PortState, PortTable, PortTableHeader, PublisherSlot,
    SubscriberSlot,
};
