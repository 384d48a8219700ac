// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use codec::{
    ByteArray, ConnectAckPacket, ConnectFlags, ConnectPacket, ConnectReturnCode, DecodePacket,
    DisconnectPacket, EncodePacket, Packet, PacketId, PacketType, PingRequestPacket,
    PingResponsePacket, PublishAckPacket, PublishPacket, PublishReceivedPacket, QoS, SubscribeAck,
    SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};

use crate::client::Client;
use crate::commands::{ControlCmd, InFlight, InFlightKind, ReplySender};
use crate::connect_options::{ConnectOptions, DEFAULT_CLIENT_ID, KEEP_ALIVE};
use crate::error::{Error, ErrorKind};
use crate::handler::{ErrorHandler, LogErrorHandler, PayloadReader, PublishHandler};
use crate::message::Message;
use crate::status::ClientStatus;

/// Default upper bound of the topic length of an incoming publish packet.
pub const DEFAULT_MAX_TOPIC_LEN: usize = 128;

/// Packet identifier used for publish and subscribe requests.
///
/// With at most one request in flight, acknowledgements correlate by
/// position and fixed identifiers are sufficient.
const MESSAGE_PACKET_ID: PacketId = PacketId::new(1);

/// Packet identifier used for unsubscribe requests.
const UNSUBSCRIBE_PACKET_ID: PacketId = PacketId::new(2);

/// The engine side of a mqtt client.
///
/// The event loop owns the transport endpoints and all connection state.
/// [`run()`](Self::run) multiplexes two event sources onto the wire: control
/// requests from [`Client`] handles and packets from the server. The
/// application decides which task hosts the loop:
///
/// ```ignore
/// let (client, event_loop) = EventLoop::new("sensor", rx, tx, Box::new(handler));
/// tokio::spawn(event_loop.run());
/// client.connect(ConnectOptions::new()).await?;
/// ```
pub struct EventLoop<R, W> {
    name: String,
    status: ClientStatus,
    in_flight: Option<InFlight>,

    reader: R,
    writer: W,

    commands: mpsc::Receiver<ControlCmd>,
    commands_closed: bool,

    on_publish: Box<dyn PublishHandler>,
    on_error: Box<dyn ErrorHandler>,

    max_topic_len: usize,
}

impl<R, W> EventLoop<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a new event loop reading server packets from `transport_in`
    /// and writing client packets to `transport_out`, plus the client
    /// handle connected to it.
    ///
    /// The transport endpoints must provide ordered, reliable byte
    /// semantics; short reads are treated as I/O errors.
    ///
    /// Messages published by the server are delivered to `on_publish`.
    /// Errors are logged unless another handler is installed with
    /// [`set_on_error()`](Self::set_on_error).
    #[must_use]
    pub fn new(
        name: &str,
        transport_in: R,
        transport_out: W,
        on_publish: Box<dyn PublishHandler>,
    ) -> (Client, Self) {
        let (sender, receiver) = mpsc::channel(1);
        let client = Client::new(sender);
        let event_loop = Self {
            name: name.to_string(),
            status: ClientStatus::Disconnected,
            in_flight: None,
            reader: transport_in,
            writer: transport_out,
            commands: receiver,
            commands_closed: false,
            on_publish,
            on_error: Box::new(LogErrorHandler::default()),
            max_topic_len: DEFAULT_MAX_TOPIC_LEN,
        };
        (client, event_loop)
    }

    /// Get client name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the error handler.
    pub fn set_on_error(&mut self, on_error: Box<dyn ErrorHandler>) -> &mut Self {
        self.on_error = on_error;
        self
    }

    /// Update the upper bound of the topic length of incoming publish
    /// packets. An incoming topic larger than this limit is rejected
    /// with a message-size error.
    pub fn set_max_topic_len(&mut self, max_topic_len: usize) -> &mut Self {
        self.max_topic_len = max_topic_len;
        self
    }

    /// Run the event loop.
    ///
    /// The loop alternates between the control channel and the transport
    /// input and never returns. Handler errors are passed to the error
    /// handler and the loop resumes waiting for the next event.
    pub async fn run(mut self) {
        log::info!("{}: mqtt client event loop started", self.name);

        loop {
            let result = tokio::select! {
                cmd = self.commands.recv(), if !self.commands_closed => match cmd {
                    Some(cmd) => self.read_control_message(cmd).await,
                    None => {
                        // All client handles are gone, keep serving the transport.
                        self.commands_closed = true;
                        Ok(())
                    }
                },
                byte = self.reader.read_u8() => match byte {
                    Ok(byte) => self.read_server_message(byte).await,
                    Err(err) => Err(Error::from(err)),
                },
            };

            if let Err(err) = result {
                self.on_error.on_error(&self.name, &err);
            }
        }
    }

    /// Dispatch one control request from the application.
    async fn read_control_message(&mut self, cmd: ControlCmd) -> Result<(), Error> {
        if self.in_flight.is_some() {
            return self.reject_busy(cmd);
        }

        match self.status {
            ClientStatus::Disconnected => match cmd {
                ControlCmd::Connect { options, reply } => self.handle_connect(options, reply).await,
                cmd => {
                    log::debug!(
                        "{}: Ignore control request while disconnected: {cmd:?}",
                        self.name
                    );
                    Ok(())
                }
            },
            ClientStatus::Connected => match cmd {
                ControlCmd::Disconnect { reply } => self.handle_disconnect(reply).await,
                ControlCmd::Ping { reply } => self.handle_ping(reply).await,
                ControlCmd::Publish { message, reply } => self.handle_publish(message, reply).await,
                ControlCmd::Subscribe { message, reply } => {
                    self.handle_subscribe(message, reply).await
                }
                ControlCmd::Unsubscribe { message, reply } => {
                    self.handle_unsubscribe(message, reply).await
                }
                ControlCmd::Connect { .. } => {
                    log::debug!("{}: Ignore connect request while connected", self.name);
                    Ok(())
                }
            },
        }
    }

    /// Answer a request which arrived while another one is still waiting
    /// for its acknowledgement.
    fn reject_busy(&self, cmd: ControlCmd) -> Result<(), Error> {
        log::debug!("{}: Reject control request, request in flight", self.name);
        let err = Error::new(
            ErrorKind::ProtocolError,
            "Another request is already in flight",
        );
        let reply = match cmd {
            ControlCmd::Connect { reply, .. }
            | ControlCmd::Disconnect { reply }
            | ControlCmd::Ping { reply }
            | ControlCmd::Publish { reply, .. }
            | ControlCmd::Subscribe { reply, .. }
            | ControlCmd::Unsubscribe { reply, .. } => reply,
        };
        let _ = reply.send(Err(err.clone()));
        Err(err)
    }

    async fn handle_connect(
        &mut self,
        options: ConnectOptions,
        reply: ReplySender,
    ) -> Result<(), Error> {
        let result = self.write_connect(&options).await;
        self.await_ack(InFlightKind::Connect, reply, result)
    }

    async fn write_connect(&mut self, options: &ConnectOptions) -> Result<(), Error> {
        // A Client ID is required [MQTT-3.1.3-3], fill in ours if the
        // application has not specified one.
        let client_id = if options.client_id().is_empty() {
            DEFAULT_CLIENT_ID
        } else {
            options.client_id()
        };
        let mut packet = ConnectPacket::new(client_id)?;
        packet.set_keep_alive(KEEP_ALIVE);

        // Resuming sessions is not supported, force a clean session.
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(true);

        if let Some(will) = options.will() {
            // Will topic and payload are either both set or both unset.
            if will.topic.is_empty() != will.payload.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "Will topic and payload must be set together",
                ));
            }
            if !will.topic.is_empty() {
                flags
                    .set_will(true)
                    .set_will_qos(will.qos)
                    .set_will_retain(will.retain);
                packet.set_will_topic(&will.topic)?;
                packet.set_will_message(&will.payload)?;
            }
        }
        if let Some(username) = options.username() {
            flags.set_has_username(true);
            packet.set_username(username)?;
        }
        if let Some(password) = options.password() {
            flags.set_has_password(true);
            packet.set_password(password)?;
        }
        packet.set_connect_flags(flags);

        self.send(&packet).await
    }

    async fn handle_disconnect(&mut self, reply: ReplySender) -> Result<(), Error> {
        let result = self.send(&DisconnectPacket::new()).await;
        if result.is_ok() {
            self.status = ClientStatus::Disconnected;
            log::info!("{}: Disconnected from the server", self.name);
        }
        // The server does not acknowledge a disconnect, answer the caller
        // with the write result.
        let _ = reply.send(result.clone());
        result
    }

    async fn handle_ping(&mut self, reply: ReplySender) -> Result<(), Error> {
        let result = self.send(&PingRequestPacket::new()).await;
        self.await_ack(InFlightKind::Ping, reply, result)
    }

    async fn handle_publish(&mut self, message: Message, reply: ReplySender) -> Result<(), Error> {
        if message.qos == QoS::ExactOnce {
            let err = Error::new(ErrorKind::InvalidArgument, "QoS 2 publish is not supported");
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        }

        let result = self.write_publish(&message).await;
        if message.qos == QoS::AtMostOnce {
            // No puback will arrive, answer the caller right away.
            let _ = reply.send(result.clone());
            result
        } else {
            self.await_ack(InFlightKind::Publish, reply, result)
        }
    }

    async fn write_publish(&mut self, message: &Message) -> Result<(), Error> {
        let mut packet = PublishPacket::new(&message.topic, message.qos, &message.payload)?;
        if message.qos != QoS::AtMostOnce {
            packet.set_packet_id(MESSAGE_PACKET_ID);
        }
        self.send(&packet).await
    }

    async fn handle_subscribe(
        &mut self,
        message: Message,
        reply: ReplySender,
    ) -> Result<(), Error> {
        let result = self.write_subscribe(&message).await;
        self.await_ack(InFlightKind::Subscribe, reply, result)
    }

    async fn write_subscribe(&mut self, message: &Message) -> Result<(), Error> {
        let packet = SubscribePacket::new(&message.topic, message.qos, MESSAGE_PACKET_ID)?;
        self.send(&packet).await
    }

    async fn handle_unsubscribe(
        &mut self,
        message: Message,
        reply: ReplySender,
    ) -> Result<(), Error> {
        let result = self.write_unsubscribe(&message).await;
        self.await_ack(InFlightKind::Unsubscribe, reply, result)
    }

    async fn write_unsubscribe(&mut self, message: &Message) -> Result<(), Error> {
        let packet = UnsubscribePacket::new(&message.topic, UNSUBSCRIBE_PACKET_ID)?;
        self.send(&packet).await
    }

    /// Park `reply` in the in-flight slot when the request packet went
    /// out, answer the caller immediately otherwise.
    fn await_ack(
        &mut self,
        kind: InFlightKind,
        reply: ReplySender,
        result: Result<(), Error>,
    ) -> Result<(), Error> {
        match result {
            Ok(()) => {
                self.in_flight = Some(InFlight { kind, reply });
                Ok(())
            }
            Err(err) => {
                let _ = reply.send(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Read one packet from the server and dispatch by packet type.
    ///
    /// The whole frame is read before it is interpreted, so a rejected
    /// packet never leaves stray bytes on the wire.
    async fn read_server_message(&mut self, first_byte: u8) -> Result<(), Error> {
        let mut frame = vec![first_byte];
        let size = self.read_remaining_length(&mut frame).await?;
        let header_len = frame.len();
        frame.resize(header_len + size, 0);
        self.reader.read_exact(&mut frame[header_len..]).await?;

        let packet_type = PacketType::try_from(first_byte).map_err(Error::from)?;
        log::debug!(
            "{}: Read '{packet_type}' message from the server",
            self.name
        );

        match packet_type {
            PacketType::ConnectAck => self.handle_connack(&frame),
            PacketType::PublishAck => self.handle_puback(&frame),
            PacketType::SubscribeAck => self.handle_suback(&frame),
            PacketType::UnsubscribeAck => self.handle_unsuback(&frame),
            PacketType::PingResponse => self.handle_pingresp(&frame),
            PacketType::Publish { qos, .. } => {
                self.handle_server_publish(qos, size, &frame[header_len..])
                    .await
            }
            t => {
                log::debug!("{}: Unhandled '{t}' message from the server", self.name);
                Ok(())
            }
        }
    }

    /// Read the variable length size field of a fixed header, appending
    /// the raw bytes to `frame`.
    async fn read_remaining_length(&mut self, frame: &mut Vec<u8>) -> Result<usize, Error> {
        let mut multiplier: usize = 1;
        let mut size: usize = 0;

        loop {
            let byte = self.reader.read_u8().await?;
            frame.push(byte);
            size += usize::from(byte & 0x7f) * multiplier;

            if byte & 0x80 == 0 {
                break;
            }

            multiplier *= 128;
            if multiplier > 128 * 128 * 128 {
                return Err(Error::new(
                    ErrorKind::ProtocolError,
                    "Remaining length field exceeds four bytes",
                ));
            }
        }

        Ok(size)
    }

    fn handle_connack(&mut self, frame: &[u8]) -> Result<(), Error> {
        let in_flight = self.take_in_flight(InFlightKind::Connect)?;
        let result = self.process_connack(frame);
        let _ = in_flight.reply.send(result.clone());
        result
    }

    fn process_connack(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = ConnectAckPacket::decode(&mut ba)?;

        // A clean session was requested, the server cannot have one stored.
        if packet.session_present() {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "Unexpected session-present flag in connack",
            ));
        }
        if packet.return_code() != ConnectReturnCode::Accepted {
            return Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!("Connection refused: {:?}", packet.return_code()),
            ));
        }

        self.status = ClientStatus::Connected;
        log::info!("{}: Connected to the server", self.name);
        Ok(())
    }

    fn handle_puback(&mut self, frame: &[u8]) -> Result<(), Error> {
        let in_flight = self.take_in_flight(InFlightKind::Publish)?;
        let result = process_puback(frame);
        let _ = in_flight.reply.send(result.clone());
        result
    }

    fn handle_suback(&mut self, frame: &[u8]) -> Result<(), Error> {
        let in_flight = self.take_in_flight(InFlightKind::Subscribe)?;
        let result = process_suback(frame);
        let _ = in_flight.reply.send(result.clone());
        result
    }

    fn handle_unsuback(&mut self, frame: &[u8]) -> Result<(), Error> {
        let in_flight = self.take_in_flight(InFlightKind::Unsubscribe)?;
        let result = process_unsuback(frame);
        let _ = in_flight.reply.send(result.clone());
        result
    }

    fn handle_pingresp(&mut self, frame: &[u8]) -> Result<(), Error> {
        let in_flight = self.take_in_flight(InFlightKind::Ping)?;
        let result = process_pingresp(frame);
        let _ = in_flight.reply.send(result.clone());
        result
    }

    /// Handle a publish packet from the server.
    ///
    /// `QoS` 1 packets are acknowledged with a puback, `QoS` 2 packets
    /// with a pubrec, before the payload is handed to the publish
    /// handler. The pubrel/pubcomp half of the `QoS` 2 flow is not
    /// implemented; a pubrel from the server is consumed and dropped.
    async fn handle_server_publish(
        &mut self,
        qos: QoS,
        size: usize,
        body: &[u8],
    ) -> Result<(), Error> {
        let mut ba = ByteArray::new(body);

        let topic_len = usize::from(ba.read_u16()?);
        if topic_len > self.max_topic_len {
            return Err(Error::from_string(
                ErrorKind::MessageSize,
                format!(
                    "Topic length {topic_len} exceeds limit of {}",
                    self.max_topic_len
                ),
            ));
        }
        let topic = ba.read_string(topic_len)?;

        let payload_len = match qos {
            QoS::AtMostOnce => size - topic_len - 2,
            QoS::AtLeastOnce | QoS::ExactOnce => {
                let packet_id = PacketId::decode(&mut ba)?;
                if qos == QoS::AtLeastOnce {
                    self.send(&PublishAckPacket::new(packet_id)).await?;
                } else {
                    self.send(&PublishReceivedPacket::new(packet_id)).await?;
                }
                size - topic_len - 4
            }
        };
        let payload = ba.read_bytes(payload_len)?;

        let mut reader = PayloadReader::new(payload);
        self.on_publish
            .on_publish(&self.name, &topic, &mut reader)?;

        if reader.remaining() != 0 {
            return Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!(
                    "Publish handler left {} of {payload_len} payload bytes unread",
                    reader.remaining()
                ),
            ));
        }
        Ok(())
    }

    /// Clear and return the in-flight slot if it holds a `kind` request.
    fn take_in_flight(&mut self, kind: InFlightKind) -> Result<InFlight, Error> {
        match self.in_flight.take() {
            Some(in_flight) if in_flight.kind == kind => Ok(in_flight),
            other => {
                self.in_flight = other;
                Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!("Unexpected ack, no {kind:?} request in flight"),
                ))
            }
        }
    }

    /// Encode `packet` and write it to the transport output.
    async fn send<P: Packet + EncodePacket>(&mut self, packet: &P) -> Result<(), Error> {
        log::debug!(
            "{}: Writing '{}' message to the server",
            self.name,
            packet.packet_type()
        );

        let mut buf = Vec::with_capacity(packet.bytes()?);
        packet.encode(&mut buf)?;
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn process_puback(frame: &[u8]) -> Result<(), Error> {
    let mut ba = ByteArray::new(frame);
    let packet = PublishAckPacket::decode(&mut ba)?;
    if packet.packet_id() != MESSAGE_PACKET_ID {
        return Err(Error::from_string(
            ErrorKind::ProtocolError,
            format!("puback: Invalid packet id {}", packet.packet_id()),
        ));
    }
    Ok(())
}

fn process_suback(frame: &[u8]) -> Result<(), Error> {
    let mut ba = ByteArray::new(frame);
    let packet = SubscribeAckPacket::decode(&mut ba)?;
    if packet.packet_id() != MESSAGE_PACKET_ID {
        return Err(Error::from_string(
            ErrorKind::ProtocolError,
            format!("suback: Invalid packet id {}", packet.packet_id()),
        ));
    }
    match packet.ack() {
        SubscribeAck::QoS(_granted) => Ok(()),
        SubscribeAck::Failed => Err(Error::new(
            ErrorKind::ProtocolError,
            "Subscription failed by the server",
        )),
    }
}

fn process_unsuback(frame: &[u8]) -> Result<(), Error> {
    let mut ba = ByteArray::new(frame);
    let packet = UnsubscribeAckPacket::decode(&mut ba)?;
    if packet.packet_id() != UNSUBSCRIBE_PACKET_ID {
        return Err(Error::from_string(
            ErrorKind::ProtocolError,
            format!("unsuback: Invalid packet id {}", packet.packet_id()),
        ));
    }
    Ok(())
}

fn process_pingresp(frame: &[u8]) -> Result<(), Error> {
    let mut ba = ByteArray::new(frame);
    PingResponsePacket::decode(&mut ba)?;
    Ok(())
}
