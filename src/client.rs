// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use tokio::sync::{mpsc, oneshot};

use crate::commands::ControlCmd;
use crate::connect_options::ConnectOptions;
use crate::error::{Error, ErrorKind};
use crate::message::Message;

/// Application side handle of a mqtt client.
///
/// Each entry point enqueues one control request to the event loop and
/// blocks the calling task until the loop posts the result back. Requests
/// are served strictly one at a time, in channel order.
///
/// The handle is cheap to clone. Note that the engine answers a request
/// sent while another one is still waiting for its acknowledgement with a
/// protocol error, so concurrent callers must coordinate themselves.
#[derive(Debug, Clone)]
pub struct Client {
    sender: mpsc::Sender<ControlCmd>,
}

impl Client {
    pub(crate) fn new(sender: mpsc::Sender<ControlCmd>) -> Self {
        Self { sender }
    }

    /// Connect to the server with `options`.
    ///
    /// # Errors
    ///
    /// Returns error if the connect packet cannot be written or the server
    /// refuses the connection.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), Error> {
        let (reply, receiver) = oneshot::channel();
        self.control(ControlCmd::Connect { options, reply }, receiver)
            .await
    }

    /// Send a disconnect packet to the server.
    ///
    /// The server does not acknowledge a disconnect; the result of writing
    /// the packet is returned directly.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect packet cannot be written.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let (reply, receiver) = oneshot::channel();
        self.control(ControlCmd::Disconnect { reply }, receiver)
            .await
    }

    /// Send a ping request to the server and wait for the ping response.
    ///
    /// # Errors
    ///
    /// Returns error if the packet cannot be written or the response is
    /// malformed.
    pub async fn ping(&self) -> Result<(), Error> {
        let (reply, receiver) = oneshot::channel();
        self.control(ControlCmd::Ping { reply }, receiver).await
    }

    /// Publish `message.payload` to `message.topic`.
    ///
    /// A `QoS` 0 publish resolves as soon as the packet is written; a
    /// `QoS` 1 publish waits for the puback from the server. `QoS` 2 is
    /// not supported on the publish side.
    ///
    /// # Errors
    ///
    /// Returns error if the message is invalid, the packet cannot be
    /// written, or the acknowledgement is malformed.
    pub async fn publish(&self, message: Message) -> Result<(), Error> {
        let (reply, receiver) = oneshot::channel();
        self.control(ControlCmd::Publish { message, reply }, receiver)
            .await
    }

    /// Subscribe to the topic filter in `message.topic` with the maximum
    /// `QoS` level in `message.qos`, waiting for the suback.
    ///
    /// # Errors
    ///
    /// Returns error if the packet cannot be written, or the server fails
    /// the subscription.
    pub async fn subscribe(&self, message: Message) -> Result<(), Error> {
        let (reply, receiver) = oneshot::channel();
        self.control(ControlCmd::Subscribe { message, reply }, receiver)
            .await
    }

    /// Remove the subscription of the topic filter in `message.topic`,
    /// waiting for the unsuback.
    ///
    /// # Errors
    ///
    /// Returns error if the packet cannot be written or the
    /// acknowledgement is malformed.
    pub async fn unsubscribe(&self, message: Message) -> Result<(), Error> {
        let (reply, receiver) = oneshot::channel();
        self.control(ControlCmd::Unsubscribe { message, reply }, receiver)
            .await
    }

    /// Enqueue one control request and block on its reply.
    async fn control(
        &self,
        cmd: ControlCmd,
        receiver: oneshot::Receiver<Result<(), Error>>,
    ) -> Result<(), Error> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_err| Error::new(ErrorKind::ChannelError, "Event loop is gone"))?;

        // The reply sender is dropped without an answer when the loop
        // ignores the request, e.g. a publish while disconnected.
        receiver.await.map_err(|_err| {
            Error::new(
                ErrorKind::ChannelError,
                "Request dropped by the event loop",
            )
        })?
    }
}
