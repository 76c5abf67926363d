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
//

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use log::{debug, error, trace, warn};
use ssh_encoding::Encode;
use tokio::sync::oneshot;

use crate::channel::ChannelParams;
use crate::parsing::Packet;
use crate::pending::ReplyQueue;
use crate::{msg, ChannelId, ChannelOpenFailure, Error};

/// Window size and maximum packet size advertised for the channels we open
/// or accept.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial receive window, in bytes, granted to the peer per channel.
    pub window_size: u32,
    /// Largest single data payload we are willing to receive.
    pub maximum_packet_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            window_size: 2097152,
            maximum_packet_size: 32768,
        }
    }
}

/// Decision returned by [`Handler::channel_open_request`].
#[derive(Debug)]
pub enum ChannelOpenOutcome {
    /// Accept the channel; `data` is sent back inside the open confirmation.
    Accept { data: Vec<u8> },
    /// Reject the channel with a reason code and a description.
    Reject {
        reason: ChannelOpenFailure,
        message: String,
    },
}

/// The pluggable side of a [`Connection`]: channel-type decisions, data
/// delivery and request handling.
///
/// Every callback receives the connection, so a handler can reply (send
/// data, close, request) from inside the callback. Default implementations
/// reject peer-initiated channels and requests and ignore everything else.
#[allow(unused_variables)]
pub trait Handler: Sized {
    type Error: From<crate::Error> + Send;

    /// The peer wants to open a channel of type `channel_type`. `channel` is
    /// the local id reserved for it; the channel is registered only if this
    /// returns [`ChannelOpenOutcome::Accept`].
    async fn channel_open_request(
        &mut self,
        channel_type: &str,
        channel: ChannelId,
        extra: &[u8],
        session: &mut Connection,
    ) -> Result<ChannelOpenOutcome, Self::Error> {
        Ok(ChannelOpenOutcome::Reject {
            reason: ChannelOpenFailure::UnknownChannelType,
            message: "Unknown channel type".into(),
        })
    }

    /// Called when the peer confirmed our request to open a channel. The
    /// channel can be written to from this point on.
    async fn channel_open_confirmation(
        &mut self,
        channel: ChannelId,
        max_packet_size: u32,
        window_size: u32,
        extra: &[u8],
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the peer rejected our request to open a channel.
    async fn channel_open_failure(
        &mut self,
        channel: ChannelId,
        reason: ChannelOpenFailure,
        description: &str,
        language: &str,
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when a data payload arrives on a channel.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when an extended data payload arrives. Code 1 is stderr by
    /// convention (see [RFC4254](https://tools.ietf.org/html/rfc4254#section-5.2)).
    async fn extended_data(
        &mut self,
        channel: ChannelId,
        ext: u32,
        data: &[u8],
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the peer will send no more data on the channel. This does
    /// not close the channel.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the peer closes its side of the channel.
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called exactly once per channel, after both sides have closed it (or
    /// at [`Connection::teardown`]). The channel is no longer in the table.
    async fn channel_closed(
        &mut self,
        channel: ChannelId,
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the peer grants us more outbound window on a channel.
    async fn window_adjusted(
        &mut self,
        channel: ChannelId,
        new_size: u32,
        session: &mut Connection,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// The peer sent a request on a channel. Returning `Ok(true)` sends
    /// CHANNEL_SUCCESS when the peer asked for a reply; `Ok(false)` or an
    /// error sends CHANNEL_FAILURE.
    async fn channel_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        data: &[u8],
        session: &mut Connection,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// The peer sent a connection-wide request. Returning `Ok(Some(data))`
    /// accepts it, echoing `data` in the success reply; `Ok(None)` rejects.
    async fn global_request(
        &mut self,
        name: &str,
        data: &[u8],
        session: &mut Connection,
    ) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(None)
    }
}

/// One `ssh-connection` service instance: the table of open channels,
/// channel-id allocation, request correlation and flow-control accounting
/// for a single transport connection.
///
/// All state is exclusively owned; drive one instance from one task only.
pub struct Connection {
    pub(crate) config: Config,
    pub(crate) channels: HashMap<ChannelId, ChannelParams>,
    /// Next local channel id. Ids are never reused while the connection
    /// lives.
    pub(crate) next_channel_id: u32,
    pub(crate) pending_requests: HashMap<ChannelId, ReplyQueue<()>>,
    pub(crate) pending_global_requests: ReplyQueue<Bytes>,
    /// Encoded payloads waiting for the transport to frame and send.
    pub(crate) outbound: VecDeque<Bytes>,
    /// Channels evicted during the current dispatch; their closed-callbacks
    /// run once dispatch is done with the handler available.
    fully_closed: VecDeque<ChannelId>,
}

impl Connection {
    pub fn new(config: Config) -> Self {
        Connection {
            config,
            channels: HashMap::new(),
            next_channel_id: 0,
            pending_requests: HashMap::new(),
            pending_global_requests: ReplyQueue::default(),
            outbound: VecDeque::new(),
            fully_closed: VecDeque::new(),
        }
    }

    /// Pop the next encoded payload to hand to the transport, if any.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    /// Number of currently registered channels (including unconfirmed ones).
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Remaining outbound window of a channel, if it is open.
    pub fn remote_window_left(&self, channel: ChannelId) -> Option<u32> {
        self.channels.get(&channel).map(|c| c.remote_window_left())
    }

    /// Remaining inbound window of a channel, if it is open.
    pub fn local_window_left(&self, channel: ChannelId) -> Option<u32> {
        self.channels.get(&channel).map(|c| c.local_window_left())
    }

    pub fn has_pending_data(&self, channel: ChannelId) -> bool {
        if let Some(channel) = self.channels.get(&channel) {
            !channel.pending_data.is_empty()
        } else {
            false
        }
    }

    fn push(&mut self, buf: Vec<u8>) {
        self.outbound.push_back(Bytes::from(buf))
    }

    fn new_channel_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_channel_id);
        self.next_channel_id += 1;
        id
    }

    /// Open a new channel on this connection.
    ///
    /// Completion is asynchronous: the peer answers with either
    /// [`Handler::channel_open_confirmation`] or
    /// [`Handler::channel_open_failure`].
    pub fn channel_open(&mut self, kind: &str, extra: &[u8]) -> Result<ChannelId, Error> {
        let id = self.new_channel_id();
        debug!(
            "opening channel {id} with {} {}",
            self.config.window_size, self.config.maximum_packet_size
        );
        let mut buf = Vec::new();
        msg::CHANNEL_OPEN.encode(&mut buf)?;
        kind.encode(&mut buf)?;
        id.encode(&mut buf)?;
        self.config.window_size.encode(&mut buf)?;
        self.config.maximum_packet_size.encode(&mut buf)?;
        buf.extend_from_slice(extra);
        self.push(buf);
        self.channels.insert(
            id,
            ChannelParams::new(id, self.config.window_size, self.config.maximum_packet_size),
        );
        Ok(id)
    }

    /// Send data on a channel. Data beyond the peer's current window is
    /// queued and flushed when the window is adjusted. Silently discarded if
    /// the channel is locally closed, or already gone.
    pub fn data(&mut self, channel: ChannelId, data: &[u8]) -> Result<(), Error> {
        self.send_data(channel, None, data)
    }

    /// Send extended data (e.g. stderr, code 1) on a channel.
    pub fn extended_data(&mut self, channel: ChannelId, ext: u32, data: &[u8]) -> Result<(), Error> {
        self.send_data(channel, Some(ext), data)
    }

    fn send_data(&mut self, channel: ChannelId, ext: Option<u32>, buf0: &[u8]) -> Result<(), Error> {
        let Some(params) = self.channels.get_mut(&channel) else {
            debug!("{channel} not saved for this connection");
            return Ok(());
        };
        if params.local_closed {
            return Ok(());
        }
        if !params.confirmed {
            return Err(Error::WrongChannel);
        }
        if !params.pending_data.is_empty() {
            // Keep send order: earlier data is still waiting for window.
            params
                .pending_data
                .push_back((Bytes::copy_from_slice(buf0), ext, 0));
            return Ok(());
        }
        let written = Self::data_noqueue(&mut self.outbound, params, buf0, ext, 0)?;
        if written < buf0.len() {
            params
                .pending_data
                .push_back((Bytes::copy_from_slice(buf0), ext, written));
        }
        Ok(())
    }

    /// Push the largest prefix of `&buf0[from..]` that fits into the peer's
    /// window as a single data message, and return the length written.
    fn data_noqueue(
        outbound: &mut VecDeque<Bytes>,
        channel: &mut ChannelParams,
        buf0: &[u8],
        ext: Option<u32>,
        from: usize,
    ) -> Result<usize, Error> {
        let buf = buf0.get(from..).unwrap_or(&[]);
        let len = buf.len().min(channel.recipient_window_size as usize);
        if len == 0 {
            return Ok(0);
        }
        let chunk = buf.get(..len).ok_or(Error::Inconsistent)?;
        let mut out = Vec::with_capacity(len + 16);
        match ext {
            None => msg::CHANNEL_DATA.encode(&mut out)?,
            Some(_) => msg::CHANNEL_EXTENDED_DATA.encode(&mut out)?,
        }
        channel.recipient_channel.encode(&mut out)?;
        if let Some(code) = ext {
            code.encode(&mut out)?;
        }
        chunk.encode(&mut out)?;
        outbound.push_back(Bytes::from(out));
        channel.recipient_window_size -= len as u32;
        trace!(
            "sent {len} bytes on {}, window left {}",
            channel.sender_channel,
            channel.recipient_window_size
        );
        Ok(len)
    }

    /// Send an EOF on a channel: no more data will follow, but the channel
    /// stays open. Deferred while earlier data is still queued.
    pub fn eof(&mut self, channel: ChannelId) -> Result<(), Error> {
        let Some(params) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        if params.local_closed {
            return Ok(());
        }
        if !params.confirmed {
            return Err(Error::WrongChannel);
        }
        if !params.pending_data.is_empty() {
            params.pending_eof = true;
            return Ok(());
        }
        debug!("sending eof on {channel}");
        let recipient = params.recipient_channel;
        let mut buf = Vec::new();
        msg::CHANNEL_EOF.encode(&mut buf)?;
        recipient.encode(&mut buf)?;
        self.push(buf);
        Ok(())
    }

    /// Close our side of a channel. Idempotent; the channel is evicted once
    /// the peer has closed its side too.
    pub fn close(&mut self, channel: ChannelId) -> Result<(), Error> {
        let Some(params) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        if params.local_closed {
            return Ok(());
        }
        if !params.confirmed {
            return Err(Error::WrongChannel);
        }
        if !params.pending_data.is_empty() {
            params.pending_close = true;
            return Ok(());
        }
        debug!("sending close on {channel}");
        let recipient = params.recipient_channel;
        params.local_closed = true;
        let evict = params.remote_closed;
        let mut buf = Vec::new();
        msg::CHANNEL_CLOSE.encode(&mut buf)?;
        recipient.encode(&mut buf)?;
        self.push(buf);
        if evict {
            self.evict(channel);
        }
        Ok(())
    }

    /// Close a channel immediately, discarding whatever is still queued for
    /// the peer's window. Used when the peer violated the protocol: the close
    /// must go out even if the peer never grants window again.
    fn abort(&mut self, channel: ChannelId) -> Result<(), Error> {
        let Some(params) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        if params.local_closed {
            return Ok(());
        }
        params.pending_data.clear();
        params.pending_eof = false;
        params.pending_close = false;
        params.local_closed = true;
        let recipient = params.recipient_channel;
        let evict = params.remote_closed;
        let mut buf = Vec::new();
        msg::CHANNEL_CLOSE.encode(&mut buf)?;
        recipient.encode(&mut buf)?;
        self.push(buf);
        if evict {
            self.evict(channel);
        }
        Ok(())
    }

    /// Grant the peer `bytes_to_add` more bytes of inbound window. Managed
    /// automatically on the receive path; call it directly only to grow the
    /// window beyond the configured size.
    pub fn adjust_window(&mut self, channel: ChannelId, bytes_to_add: u32) -> Result<(), Error> {
        let Some(params) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        if params.local_closed {
            return Ok(());
        }
        debug!(
            "adding {bytes_to_add} to {} in channel {channel}",
            params.sender_window_size
        );
        let recipient = params.recipient_channel;
        params.sender_window_size = params.sender_window_size.saturating_add(bytes_to_add);
        let mut buf = Vec::new();
        msg::CHANNEL_WINDOW_ADJUST.encode(&mut buf)?;
        recipient.encode(&mut buf)?;
        bytes_to_add.encode(&mut buf)?;
        self.push(buf);
        Ok(())
    }

    /// Send a request on a channel. With `want_reply`, returns a receiver
    /// resolved when the peer answers; replies are correlated strictly in
    /// send order. Returns `None` (and sends nothing) on a locally-closed or
    /// unknown channel.
    pub fn channel_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> Result<Option<oneshot::Receiver<Result<(), Error>>>, Error> {
        let Some(params) = self.channels.get(&channel) else {
            return Ok(None);
        };
        if params.local_closed {
            return Ok(None);
        }
        if !params.confirmed {
            return Err(Error::WrongChannel);
        }
        debug!("sending request {name} on {channel}");
        let mut buf = Vec::new();
        msg::CHANNEL_REQUEST.encode(&mut buf)?;
        params.recipient_channel.encode(&mut buf)?;
        name.encode(&mut buf)?;
        (want_reply as u8).encode(&mut buf)?;
        buf.extend_from_slice(data);
        self.push(buf);
        if want_reply {
            let (tx, rx) = oneshot::channel();
            self.pending_requests.entry(channel).or_default().push(tx);
            Ok(Some(rx))
        } else {
            Ok(None)
        }
    }

    /// Send a connection-wide request. With `want_reply`, returns a receiver
    /// resolved with the success payload, or with [`Error::RequestDenied`].
    pub fn global_request(
        &mut self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> Result<Option<oneshot::Receiver<Result<Bytes, Error>>>, Error> {
        debug!("sending global request {name}");
        let mut buf = Vec::new();
        msg::GLOBAL_REQUEST.encode(&mut buf)?;
        name.encode(&mut buf)?;
        (want_reply as u8).encode(&mut buf)?;
        buf.extend_from_slice(data);
        self.push(buf);
        if want_reply {
            let (tx, rx) = oneshot::channel();
            self.pending_global_requests.push(tx);
            Ok(Some(rx))
        } else {
            Ok(None)
        }
    }

    /// Process one inbound message payload (first byte = message type).
    ///
    /// Messages addressed to unknown channels are logged and dropped: a
    /// buggy or malicious peer must not be able to take the multiplexer
    /// down with a stray id.
    pub async fn process_packet<H: Handler>(
        &mut self,
        handler: &mut H,
        buf: &[u8],
    ) -> Result<(), H::Error> {
        self.dispatch(handler, buf).await?;
        while let Some(id) = self.fully_closed.pop_front() {
            handler.channel_closed(id, self).await?;
        }
        Ok(())
    }

    async fn dispatch<H: Handler>(&mut self, handler: &mut H, buf: &[u8]) -> Result<(), H::Error> {
        match Packet::parse(buf).map_err(crate::Error::from)? {
            Packet::GlobalRequest(req) => {
                debug!("got global {} request", req.name);
                let ret = handler.global_request(&req.name, &req.data, self).await?;
                if req.want_reply {
                    let mut out = Vec::new();
                    match ret {
                        Some(data) => {
                            msg::REQUEST_SUCCESS.encode(&mut out).map_err(crate::Error::from)?;
                            out.extend_from_slice(&data);
                        }
                        None => {
                            msg::REQUEST_FAILURE.encode(&mut out).map_err(crate::Error::from)?;
                        }
                    }
                    self.push(out);
                }
                Ok(())
            }
            Packet::RequestSuccess { data } => {
                debug!("global request success");
                self.pending_global_requests.resolve(Ok(data));
                Ok(())
            }
            Packet::RequestFailure => {
                debug!("global request failure");
                self.pending_global_requests.resolve(Err(Error::RequestDenied));
                Ok(())
            }
            Packet::ChannelOpen(open) => self.channel_open_received(handler, open).await,
            Packet::ChannelOpenConfirmation(confirmation) => {
                debug!("channel_open_confirmation");
                let local = ChannelId(confirmation.recipient_channel);
                match self.channels.get_mut(&local) {
                    Some(params) if !params.confirmed => {
                        params.confirm(&confirmation);
                        handler
                            .channel_open_confirmation(
                                local,
                                confirmation.maximum_packet_size,
                                confirmation.initial_window_size,
                                &confirmation.extra,
                                self,
                            )
                            .await
                    }
                    Some(_) => {
                        warn!("open confirmation for already confirmed channel {local}");
                        Ok(())
                    }
                    None => {
                        warn!("open confirmation for unknown channel {local}");
                        Ok(())
                    }
                }
            }
            Packet::ChannelOpenFailure(failure) => {
                debug!("channel_open_failure");
                let local = ChannelId(failure.recipient_channel);
                if self.channels.remove(&local).is_none() {
                    warn!("open failure for unknown channel {local}");
                    return Ok(());
                }
                let reason = ChannelOpenFailure::from_u32(failure.reason)
                    .unwrap_or(ChannelOpenFailure::Unknown);
                if let Some(mut queue) = self.pending_requests.remove(&local) {
                    queue.fail_all(|| Error::ChannelOpenFailure {
                        reason,
                        description: failure.description.clone(),
                    });
                }
                handler
                    .channel_open_failure(
                        local,
                        reason,
                        &failure.description,
                        &failure.language,
                        self,
                    )
                    .await
            }
            Packet::ChannelWindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                debug!("channel_window_adjust, amount: {bytes_to_add}");
                let local = ChannelId(recipient_channel);
                let new_size = match self.channels.get_mut(&local) {
                    Some(params) => {
                        params.recipient_window_size =
                            params.recipient_window_size.saturating_add(bytes_to_add);
                        params.recipient_window_size
                    }
                    None => {
                        warn!("window adjust for unknown channel {local}");
                        return Ok(());
                    }
                };
                self.flush_pending(local).map_err(crate::Error::from)?;
                handler.window_adjusted(local, new_size, self).await
            }
            Packet::ChannelData {
                recipient_channel,
                data,
            } => {
                trace!("channel_data");
                let local = ChannelId(recipient_channel);
                if self.receive_data(local, data.len())? {
                    handler.data(local, &data, self).await?;
                }
                Ok(())
            }
            Packet::ChannelExtendedData {
                recipient_channel,
                ext,
                data,
            } => {
                debug!("channel_extended_data");
                let local = ChannelId(recipient_channel);
                if self.receive_data(local, data.len())? {
                    handler.extended_data(local, ext, &data, self).await?;
                }
                Ok(())
            }
            Packet::ChannelEof { recipient_channel } => {
                debug!("channel_eof");
                let local = ChannelId(recipient_channel);
                if !self.channels.contains_key(&local) {
                    warn!("eof for unknown channel {local}");
                    return Ok(());
                }
                handler.channel_eof(local, self).await
            }
            Packet::ChannelClose { recipient_channel } => {
                debug!("channel_close");
                let local = ChannelId(recipient_channel);
                let evict = match self.channels.get_mut(&local) {
                    Some(params) => {
                        params.remote_closed = true;
                        params.local_closed
                    }
                    None => {
                        warn!("close for unknown channel {local}");
                        return Ok(());
                    }
                };
                handler.channel_close(local, self).await?;
                if evict {
                    self.evict(local);
                }
                Ok(())
            }
            Packet::ChannelRequest(req) => {
                let local = ChannelId(req.recipient_channel);
                debug!("channel_request: {local} {:?}", req.name);
                if !self.channels.contains_key(&local) {
                    warn!("request for unknown channel {local}");
                    return Ok(());
                }
                let result = handler
                    .channel_request(local, &req.name, &req.data, self)
                    .await;
                if req.want_reply {
                    // The handler may have closed the channel from inside the
                    // callback.
                    if let Some(params) = self.channels.get(&local) {
                        let reply = match result {
                            Ok(true) => msg::CHANNEL_SUCCESS,
                            _ => msg::CHANNEL_FAILURE,
                        };
                        let recipient = params.recipient_channel;
                        let mut out = Vec::new();
                        reply.encode(&mut out).map_err(crate::Error::from)?;
                        recipient.encode(&mut out).map_err(crate::Error::from)?;
                        self.push(out);
                    }
                }
                if result.is_err() {
                    debug!("channel request {:?} failed in the handler", req.name);
                }
                Ok(())
            }
            Packet::ChannelSuccess { recipient_channel } => {
                let local = ChannelId(recipient_channel);
                trace!("channel_success {local}");
                if let Some(queue) = self.pending_requests.get_mut(&local) {
                    queue.resolve(Ok(()));
                } else {
                    warn!("channel success with no outstanding request on {local}");
                }
                Ok(())
            }
            Packet::ChannelFailure { recipient_channel } => {
                let local = ChannelId(recipient_channel);
                trace!("channel_failure {local}");
                if let Some(queue) = self.pending_requests.get_mut(&local) {
                    queue.resolve(Err(Error::RequestDenied));
                } else {
                    warn!("channel failure with no outstanding request on {local}");
                }
                Ok(())
            }
            Packet::Unknown { typ } => {
                debug!("unknown message received: {typ}");
                Ok(())
            }
        }
    }

    async fn channel_open_received<H: Handler>(
        &mut self,
        handler: &mut H,
        open: crate::parsing::OpenChannelMessage,
    ) -> Result<(), H::Error> {
        debug!("got channel {:?} request", open.channel_type);
        let id = self.new_channel_id();
        let outcome = handler
            .channel_open_request(&open.channel_type, id, &open.extra, self)
            .await;
        let (reason, message) = match outcome {
            Ok(ChannelOpenOutcome::Accept { data }) => {
                let mut params =
                    ChannelParams::new(id, self.config.window_size, self.config.maximum_packet_size);
                params.recipient_channel = open.sender_channel;
                params.recipient_window_size = open.initial_window_size;
                params.recipient_maximum_packet_size = open.maximum_packet_size;
                params.confirmed = true;
                self.channels.insert(id, params);
                debug!("confirming channel {id}");
                let mut out = Vec::new();
                let r: Result<(), ssh_encoding::Error> = (|| {
                    msg::CHANNEL_OPEN_CONFIRMATION.encode(&mut out)?;
                    open.sender_channel.encode(&mut out)?;
                    id.encode(&mut out)?;
                    self.config.window_size.encode(&mut out)?;
                    self.config.maximum_packet_size.encode(&mut out)?;
                    Ok(())
                })();
                r.map_err(crate::Error::from)?;
                out.extend_from_slice(&data);
                self.push(out);
                return Ok(());
            }
            Ok(ChannelOpenOutcome::Reject { reason, message }) => (reason, message),
            Err(_) => {
                error!("channel open failed in the handler");
                (
                    ChannelOpenFailure::ConnectFailed,
                    "channel open failed".to_string(),
                )
            }
        };
        debug!("rejecting channel {:?}: {message}", open.channel_type);
        let mut out = Vec::new();
        let r: Result<(), ssh_encoding::Error> = (|| {
            msg::CHANNEL_OPEN_FAILURE.encode(&mut out)?;
            open.sender_channel.encode(&mut out)?;
            reason.code().encode(&mut out)?;
            message.as_str().encode(&mut out)?;
            "en".encode(&mut out)?;
            Ok(())
        })();
        r.map_err(crate::Error::from)?;
        self.push(out);
        Ok(())
    }

    /// Window accounting for one inbound data payload. Returns whether the
    /// payload should be delivered; an over-budget payload closes the
    /// channel instead, without touching the counters.
    fn receive_data(&mut self, channel: ChannelId, len: usize) -> Result<bool, Error> {
        let (violation, deficit) = {
            let Some(params) = self.channels.get_mut(&channel) else {
                warn!("data for unknown channel {channel}");
                return Ok(false);
            };
            if !params.confirmed {
                warn!("data for unconfirmed channel {channel}");
                return Ok(false);
            }
            if params.local_closed {
                debug!("data on locally closed channel {channel}");
                return Ok(false);
            }
            let len = len as u32;
            if len > params.sender_maximum_packet_size || len > params.sender_window_size {
                (true, 0)
            } else {
                params.sender_window_size -= len;
                if params.sender_window_size < params.sender_initial_window_size / 2 {
                    (
                        false,
                        params.sender_initial_window_size - params.sender_window_size,
                    )
                } else {
                    (false, 0)
                }
            }
        };
        if violation {
            error!("too much data on {channel}");
            self.abort(channel)?;
            return Ok(false);
        }
        if deficit > 0 {
            self.adjust_window(channel, deficit)?;
        }
        Ok(true)
    }

    /// Flush data queued while the peer's window was exhausted, then any
    /// deferred EOF or close.
    fn flush_pending(&mut self, channel: ChannelId) -> Result<(), Error> {
        let flushed = match self.channels.get_mut(&channel) {
            Some(params) => {
                let complete = Self::flush_channel(&mut self.outbound, params)?;
                complete.then_some((params.pending_eof, params.pending_close))
            }
            None => return Ok(()),
        };
        if let Some((pending_eof, pending_close)) = flushed {
            if pending_eof {
                if let Some(params) = self.channels.get_mut(&channel) {
                    params.pending_eof = false;
                }
                self.eof(channel)?;
            }
            if pending_close {
                if let Some(params) = self.channels.get_mut(&channel) {
                    params.pending_close = false;
                }
                self.close(channel)?;
            }
        }
        Ok(())
    }

    fn flush_channel(
        outbound: &mut VecDeque<Bytes>,
        channel: &mut ChannelParams,
    ) -> Result<bool, Error> {
        while let Some((buf, ext, from)) = channel.pending_data.pop_front() {
            let written = Self::data_noqueue(outbound, channel, &buf, ext, from)?;
            if from + written < buf.len() {
                channel.pending_data.push_front((buf, ext, from + written));
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn evict(&mut self, channel: ChannelId) {
        // Guard against being called twice for the same channel.
        if self.channels.remove(&channel).is_some() {
            debug!("channel {channel} fully closed");
            if let Some(mut queue) = self.pending_requests.remove(&channel) {
                queue.fail_all(|| Error::ChannelClosed);
            }
            self.fully_closed.push_back(channel);
        }
    }

    /// Tear the service down after transport loss.
    ///
    /// Every confirmed channel is evicted (its closed-callback fires exactly
    /// once), every unconfirmed open fails with a connection-lost open
    /// failure, and every pending completion resolves with
    /// [`Error::Disconnect`]. Nothing is left pending afterwards.
    pub async fn teardown<H: Handler>(&mut self, handler: &mut H) -> Result<(), H::Error> {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            let confirmed = match self.channels.get(&id) {
                Some(params) => params.confirmed,
                None => continue,
            };
            if confirmed {
                self.evict(id);
            } else {
                self.channels.remove(&id);
                self.pending_requests.remove(&id);
                handler
                    .channel_open_failure(
                        id,
                        ChannelOpenFailure::ConnectFailed,
                        "Connection lost",
                        "",
                        self,
                    )
                    .await?;
            }
        }
        self.pending_global_requests.fail_all(|| Error::Disconnect);
        for (_, mut queue) in self.pending_requests.drain() {
            queue.fail_all(|| Error::Disconnect);
        }
        while let Some(id) = self.fully_closed.pop_front() {
            handler.channel_closed(id, self).await?;
        }
        Ok(())
    }
}
