#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match)]
#![allow(async_fn_in_trait)]
// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multiplexed channel layer for the SSH connection service.
//!
//! This crate implements the `ssh-connection` service of
//! [RFC 4254](https://tools.ietf.org/html/rfc4254): channel lifecycle,
//! credit-based flow control, and request correlation, multiplexing many
//! logical byte streams over one reliable, ordered, already-authenticated
//! transport. Key exchange, encryption and packet framing live *below* this
//! layer: a [`Connection`] consumes and produces message payloads whose
//! first byte is the message type code, and the embedding transport is
//! responsible for moving those payloads.
//!
//! The normal way to use this crate is to create a *handler*, i.e. a type
//! implementing [`Handler`], and drive a [`Connection`] with it:
//!
//! * feed every inbound payload to [`Connection::process_packet`],
//! * drain [`Connection::next_packet`] into the transport after each call,
//! * call the outbound operations ([`Connection::channel_open`],
//!   [`Connection::data`], [`Connection::channel_request`], …) to speak.
//!
//! Channel and global requests carry no correlation identifier on the wire;
//! replies are matched to requests strictly in send order. Operations that
//! ask for a reply therefore return a [`tokio::sync::oneshot::Receiver`]
//! resolved when the matching reply arrives, or with an error when the
//! channel closes or [`Connection::teardown`] runs. No pending completion is
//! ever left unresolved.
//!
//! A `Connection` holds plain owned state and must be driven from a single
//! task; none of its methods block or await internally, so one stalled
//! channel can never stall the others. Run several connections as several
//! independent instances.

use std::fmt::{Display, Formatter};

use ssh_encoding::{Decode, Encode};
use thiserror::Error;

mod channel;
mod connection;
mod msg;
mod parsing;
mod pending;

#[cfg(test)]
mod tests;

pub use channel::ChannelParams;
pub use connection::{ChannelOpenOutcome, Config, Connection, Handler};

#[derive(Debug, Error)]
pub enum Error {
    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// The channel was closed before the operation completed.
    #[error("Channel closed")]
    ChannelClosed,

    /// The peer refused to open a channel.
    #[error("Failed to open channel: {description} ({reason:?})")]
    ChannelOpenFailure {
        reason: ChannelOpenFailure,
        description: String,
    },

    /// The request was rejected by the other party.
    #[error("The request was rejected by the other party")]
    RequestDenied,

    /// The connection was torn down before the operation completed.
    #[error("Disconnected")]
    Disconnect,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    pub(crate) fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl Decode for ChannelId {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        Ok(Self(u32::decode(reader)?))
    }
}

impl Encode for ChannelId {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.0.encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.0.encode(writer)
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
