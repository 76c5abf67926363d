use std::collections::VecDeque;

use bytes::Bytes;

use crate::parsing::ChannelOpenConfirmation;
use crate::ChannelId;

/// The parameters of a channel.
///
/// `sender_*` fields describe our side (the inbound, receive direction),
/// `recipient_*` fields mirror the peer's advertised limits (the outbound
/// direction). The channel is fully closed, and evicted from the connection's
/// table, only once both `local_closed` and `remote_closed` are set.
#[derive(Debug)]
pub struct ChannelParams {
    pub(crate) recipient_channel: u32,
    pub(crate) sender_channel: ChannelId,
    pub(crate) recipient_window_size: u32,
    pub(crate) sender_window_size: u32,
    pub(crate) sender_initial_window_size: u32,
    pub(crate) recipient_maximum_packet_size: u32,
    pub(crate) sender_maximum_packet_size: u32,
    /// Has the other side confirmed the channel?
    pub(crate) confirmed: bool,
    pub(crate) local_closed: bool,
    pub(crate) remote_closed: bool,
    /// (buffer, extended stream #, data offset in buffer)
    pub(crate) pending_data: VecDeque<(Bytes, Option<u32>, usize)>,
    pub(crate) pending_eof: bool,
    pub(crate) pending_close: bool,
}

impl ChannelParams {
    pub(crate) fn new(sender_channel: ChannelId, window_size: u32, maxpacket: u32) -> Self {
        ChannelParams {
            recipient_channel: 0,
            sender_channel,
            recipient_window_size: 0,
            sender_window_size: window_size,
            sender_initial_window_size: window_size,
            recipient_maximum_packet_size: 0,
            sender_maximum_packet_size: maxpacket,
            confirmed: false,
            local_closed: false,
            remote_closed: false,
            pending_data: VecDeque::new(),
            pending_eof: false,
            pending_close: false,
        }
    }

    pub(crate) fn confirm(&mut self, c: &ChannelOpenConfirmation) {
        self.recipient_channel = c.sender_channel; // "sender" is the sender of the confirmation
        self.recipient_window_size = c.initial_window_size;
        self.recipient_maximum_packet_size = c.maximum_packet_size;
        self.confirmed = true;
    }

    /// The local channel identifier.
    pub fn id(&self) -> ChannelId {
        self.sender_channel
    }

    /// Remaining credit for the outbound direction, in bytes.
    pub fn remote_window_left(&self) -> u32 {
        self.recipient_window_size
    }

    /// Remaining credit we have granted the peer, in bytes.
    pub fn local_window_left(&self) -> u32 {
        self.sender_window_size
    }
}
