use bytes::Bytes;
use ssh_encoding::Decode;

use crate::{msg, Error};

/// An inbound connection-service message, decoded from a transport payload.
///
/// The message-type set of the connection service is closed and
/// protocol-defined, so inbound dispatch is a match over this enum; the
/// open-ended parts of the protocol (channel-type and request-type names)
/// stay strings inside the variants.
#[derive(Debug)]
pub(crate) enum Packet {
    GlobalRequest(GlobalRequest),
    RequestSuccess { data: Bytes },
    RequestFailure,
    ChannelOpen(OpenChannelMessage),
    ChannelOpenConfirmation(ChannelOpenConfirmation),
    ChannelOpenFailure(ChannelOpenFailureMessage),
    ChannelWindowAdjust { recipient_channel: u32, bytes_to_add: u32 },
    ChannelData { recipient_channel: u32, data: Bytes },
    ChannelExtendedData { recipient_channel: u32, ext: u32, data: Bytes },
    ChannelEof { recipient_channel: u32 },
    ChannelClose { recipient_channel: u32 },
    ChannelRequest(ChannelRequest),
    ChannelSuccess { recipient_channel: u32 },
    ChannelFailure { recipient_channel: u32 },
    Unknown { typ: u8 },
}

impl Packet {
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        let (&typ, rest) = buf.split_first().ok_or(Error::Inconsistent)?;
        let mut r = rest;
        let packet = match typ {
            msg::GLOBAL_REQUEST => Packet::GlobalRequest(GlobalRequest::parse(&mut r)?),
            msg::REQUEST_SUCCESS => Packet::RequestSuccess {
                data: Bytes::copy_from_slice(r),
            },
            msg::REQUEST_FAILURE => Packet::RequestFailure,
            msg::CHANNEL_OPEN => Packet::ChannelOpen(OpenChannelMessage::parse(&mut r)?),
            msg::CHANNEL_OPEN_CONFIRMATION => {
                Packet::ChannelOpenConfirmation(ChannelOpenConfirmation::parse(&mut r)?)
            }
            msg::CHANNEL_OPEN_FAILURE => {
                Packet::ChannelOpenFailure(ChannelOpenFailureMessage::parse(&mut r)?)
            }
            msg::CHANNEL_WINDOW_ADJUST => Packet::ChannelWindowAdjust {
                recipient_channel: u32::decode(&mut r)?,
                bytes_to_add: u32::decode(&mut r)?,
            },
            msg::CHANNEL_DATA => Packet::ChannelData {
                recipient_channel: u32::decode(&mut r)?,
                data: Bytes::decode(&mut r)?,
            },
            msg::CHANNEL_EXTENDED_DATA => Packet::ChannelExtendedData {
                recipient_channel: u32::decode(&mut r)?,
                ext: u32::decode(&mut r)?,
                data: Bytes::decode(&mut r)?,
            },
            msg::CHANNEL_EOF => Packet::ChannelEof {
                recipient_channel: u32::decode(&mut r)?,
            },
            msg::CHANNEL_CLOSE => Packet::ChannelClose {
                recipient_channel: u32::decode(&mut r)?,
            },
            msg::CHANNEL_REQUEST => Packet::ChannelRequest(ChannelRequest::parse(&mut r)?),
            msg::CHANNEL_SUCCESS => Packet::ChannelSuccess {
                recipient_channel: u32::decode(&mut r)?,
            },
            msg::CHANNEL_FAILURE => Packet::ChannelFailure {
                recipient_channel: u32::decode(&mut r)?,
            },
            typ => Packet::Unknown { typ },
        };
        Ok(packet)
    }
}

#[derive(Debug)]
pub(crate) struct GlobalRequest {
    pub name: String,
    pub want_reply: bool,
    pub data: Bytes,
}

impl GlobalRequest {
    fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        let name = String::decode(r)?;
        let want_reply = u8::decode(r)? != 0;

        Ok(Self {
            name,
            want_reply,
            data: Bytes::copy_from_slice(r),
        })
    }
}

#[derive(Debug)]
pub(crate) struct OpenChannelMessage {
    pub channel_type: String,
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
    pub extra: Bytes,
}

impl OpenChannelMessage {
    fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        // https://tools.ietf.org/html/rfc4254#section-5.1
        let channel_type = String::decode(r)?;
        let sender_channel = u32::decode(r)?;
        let initial_window_size = u32::decode(r)?;
        let maximum_packet_size = u32::decode(r)?;

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            extra: Bytes::copy_from_slice(r),
        })
    }
}

#[derive(Debug)]
pub(crate) struct ChannelOpenConfirmation {
    pub recipient_channel: u32,
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
    pub extra: Bytes,
}

impl ChannelOpenConfirmation {
    fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        let recipient_channel = u32::decode(r)?;
        let sender_channel = u32::decode(r)?;
        let initial_window_size = u32::decode(r)?;
        let maximum_packet_size = u32::decode(r)?;

        Ok(Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            extra: Bytes::copy_from_slice(r),
        })
    }
}

#[derive(Debug)]
pub(crate) struct ChannelOpenFailureMessage {
    pub recipient_channel: u32,
    pub reason: u32,
    pub description: String,
    pub language: String,
}

impl ChannelOpenFailureMessage {
    fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        let recipient_channel = u32::decode(r)?;
        let reason = u32::decode(r)?;
        let description = String::decode(r)?;
        // Some implementations omit the language tag entirely.
        let language = if r.is_empty() {
            String::new()
        } else {
            String::decode(r)?
        };

        Ok(Self {
            recipient_channel,
            reason,
            description,
            language,
        })
    }
}

#[derive(Debug)]
pub(crate) struct ChannelRequest {
    pub recipient_channel: u32,
    pub name: String,
    pub want_reply: bool,
    pub data: Bytes,
}

impl ChannelRequest {
    fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        let recipient_channel = u32::decode(r)?;
        let name = String::decode(r)?;
        let want_reply = u8::decode(r)? != 0;

        Ok(Self {
            recipient_channel,
            name,
            want_reply,
            data: Bytes::copy_from_slice(r),
        })
    }
}
