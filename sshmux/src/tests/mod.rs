#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)] // Allow unwraps, expects and panics in the test suite

use bytes::Bytes;
use ssh_encoding::Encode;

use crate::{msg, ChannelId, ChannelOpenFailure, ChannelOpenOutcome, Connection, Handler};


pub(crate) fn init() {
    let _ = env_logger::try_init();
}

/// Everything the handler observed, in callback order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    OpenRequest {
        channel_type: String,
        channel: ChannelId,
    },
    OpenConfirmation {
        channel: ChannelId,
        max_packet: u32,
        window: u32,
    },
    OpenFailure {
        channel: ChannelId,
        reason: ChannelOpenFailure,
        description: String,
    },
    Data {
        channel: ChannelId,
        data: Vec<u8>,
    },
    ExtendedData {
        channel: ChannelId,
        ext: u32,
        data: Vec<u8>,
    },
    Eof(ChannelId),
    Close(ChannelId),
    Closed(ChannelId),
    WindowAdjusted {
        channel: ChannelId,
        new_size: u32,
    },
    ChannelRequest {
        channel: ChannelId,
        name: String,
    },
    GlobalRequest {
        name: String,
    },
}

#[derive(Default)]
pub(crate) struct TestHandler {
    pub events: Vec<Event>,
    /// Accept peer-initiated channels instead of rejecting them.
    pub accept_channels: bool,
    /// Reply `true` to peer channel requests.
    pub accept_channel_requests: bool,
    /// Payload to accept peer global requests with.
    pub global_response: Option<Vec<u8>>,
    /// Close our side from inside the `channel_close` callback.
    pub close_when_peer_closes: bool,
    /// Make the `channel_request` callback fail.
    pub fail_channel_requests: bool,
    /// Make the `global_request` callback fail.
    pub fail_global_requests: bool,
}

impl Handler for TestHandler {
    type Error = crate::Error;

    async fn channel_open_request(
        &mut self,
        channel_type: &str,
        channel: ChannelId,
        _extra: &[u8],
        _session: &mut Connection,
    ) -> Result<ChannelOpenOutcome, Self::Error> {
        self.events.push(Event::OpenRequest {
            channel_type: channel_type.to_string(),
            channel,
        });
        if self.accept_channels {
            Ok(ChannelOpenOutcome::Accept { data: Vec::new() })
        } else {
            Ok(ChannelOpenOutcome::Reject {
                reason: ChannelOpenFailure::UnknownChannelType,
                message: "Unknown channel type".into(),
            })
        }
    }

    async fn channel_open_confirmation(
        &mut self,
        channel: ChannelId,
        max_packet_size: u32,
        window_size: u32,
        _extra: &[u8],
        _session: &mut Connection,
    ) -> Result<(), Self::Error> {
        self.events.push(Event::OpenConfirmation {
            channel,
            max_packet: max_packet_size,
            window: window_size,
        });
        Ok(())
    }

    async fn channel_open_failure(
        &mut self,
        channel: ChannelId,
        reason: ChannelOpenFailure,
        description: &str,
        _language: &str,
        _session: &mut Connection,
    ) -> Result<(), Self::Error> {
        self.events.push(Event::OpenFailure {
            channel,
            reason,
            description: description.to_string(),
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Connection,
    ) -> Result<(), Self::Error> {
        self.events.push(Event::Data {
            channel,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        ext: u32,
        data: &[u8],
        _session: &mut Connection,
    ) -> Result<(), Self::Error> {
        self.events.push(Event::ExtendedData {
            channel,
            ext,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Connection,
    ) -> Result<(), Self::Error> {
        self.events.push(Event::Eof(channel));
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        self.events.push(Event::Close(channel));
        if self.close_when_peer_closes {
            session.close(channel)?;
        }
        Ok(())
    }

    async fn channel_closed(
        &mut self,
        channel: ChannelId,
        _session: &mut Connection,
    ) -> Result<(), Self::Error> {
        self.events.push(Event::Closed(channel));
        Ok(())
    }

    async fn window_adjusted(
        &mut self,
        channel: ChannelId,
        new_size: u32,
        _session: &mut Connection,
    ) -> Result<(), Self::Error> {
        self.events.push(Event::WindowAdjusted { channel, new_size });
        Ok(())
    }

    async fn channel_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _data: &[u8],
        _session: &mut Connection,
    ) -> Result<bool, Self::Error> {
        self.events.push(Event::ChannelRequest {
            channel,
            name: name.to_string(),
        });
        if self.fail_channel_requests {
            Err(crate::Error::Inconsistent)
        } else {
            Ok(self.accept_channel_requests)
        }
    }

    async fn global_request(
        &mut self,
        name: &str,
        _data: &[u8],
        _session: &mut Connection,
    ) -> Result<Option<Vec<u8>>, Self::Error> {
        self.events.push(Event::GlobalRequest {
            name: name.to_string(),
        });
        if self.fail_global_requests {
            Err(crate::Error::Inconsistent)
        } else {
            Ok(self.global_response.clone())
        }
    }
}

// Peer-side payload builders. `recipient` is always our local id.

pub(crate) fn open(channel_type: &str, sender: u32, window: u32, max_packet: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_OPEN.encode(&mut buf).unwrap();
    channel_type.encode(&mut buf).unwrap();
    sender.encode(&mut buf).unwrap();
    window.encode(&mut buf).unwrap();
    max_packet.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn open_confirmation(
    recipient: ChannelId,
    sender: u32,
    window: u32,
    max_packet: u32,
) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_OPEN_CONFIRMATION.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    sender.encode(&mut buf).unwrap();
    window.encode(&mut buf).unwrap();
    max_packet.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn open_failure(recipient: ChannelId, reason: u32, description: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_OPEN_FAILURE.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    reason.encode(&mut buf).unwrap();
    description.encode(&mut buf).unwrap();
    "en".encode(&mut buf).unwrap();
    buf
}

pub(crate) fn window_adjust(recipient: ChannelId, bytes_to_add: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_WINDOW_ADJUST.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    bytes_to_add.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn data(recipient: ChannelId, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_DATA.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    payload.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn extended_data(recipient: ChannelId, ext: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_EXTENDED_DATA.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    ext.encode(&mut buf).unwrap();
    payload.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn eof(recipient: ChannelId) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_EOF.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn close(recipient: ChannelId) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_CLOSE.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn channel_request(
    recipient: ChannelId,
    name: &str,
    want_reply: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_REQUEST.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    name.encode(&mut buf).unwrap();
    (want_reply as u8).encode(&mut buf).unwrap();
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn channel_success(recipient: ChannelId) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_SUCCESS.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn channel_failure(recipient: ChannelId) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::CHANNEL_FAILURE.encode(&mut buf).unwrap();
    recipient.encode(&mut buf).unwrap();
    buf
}

pub(crate) fn global_request(name: &str, want_reply: bool, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::GLOBAL_REQUEST.encode(&mut buf).unwrap();
    name.encode(&mut buf).unwrap();
    (want_reply as u8).encode(&mut buf).unwrap();
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn request_success(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    msg::REQUEST_SUCCESS.encode(&mut buf).unwrap();
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn request_failure() -> Vec<u8> {
    let mut buf = Vec::new();
    msg::REQUEST_FAILURE.encode(&mut buf).unwrap();
    buf
}

/// Open a channel and feed back the peer's confirmation.
pub(crate) async fn open_confirmed(
    session: &mut Connection,
    handler: &mut TestHandler,
    peer_id: u32,
    window: u32,
    max_packet: u32,
) -> ChannelId {
    let id = session.channel_open("session", b"").unwrap();
    // Discard our own CHANNEL_OPEN.
    assert!(session.next_packet().is_some());
    session
        .process_packet(handler, &open_confirmation(id, peer_id, window, max_packet))
        .await
        .unwrap();
    id
}

pub(crate) fn drain(session: &mut Connection) -> Vec<Bytes> {
    let mut out = Vec::new();
    while let Some(p) = session.next_packet() {
        out.push(p)
    }
    out
}
