// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;

/// Client id used when the application supplied an empty one.
///
/// A Client ID is required by the protocol [MQTT-3.1.3-3].
pub const DEFAULT_CLIENT_ID: &str = "simba_mqtt";

/// Keep alive interval advertised to the server, in seconds.
///
/// The engine does not ping the server on its own; the application must
/// issue ping requests to refresh the server side timer.
pub const KEEP_ALIVE: u16 = 300;

/// A Will Message the server publishes on behalf of the client when the
/// connection is closed abnormally.
#[derive(Clone, Debug)]
pub struct LastWill {
    /// Topic of the Will Message.
    pub topic: String,

    /// Payload of the Will Message.
    pub payload: Vec<u8>,

    /// `QoS` level used when the Will Message is published.
    pub qos: QoS,

    /// Whether the Will Message is retained on the server.
    pub retain: bool,
}

impl LastWill {
    /// Create a new will message description.
    #[must_use]
    pub fn new(topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        }
    }
}

/// Options used to connect to the server.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    client_id: String,
    will: Option<LastWill>,
    username: Option<String>,
    password: Option<Vec<u8>>,
    clean_session: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            will: None,
            username: None,
            password: None,
            clean_session: true,
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update client id.
    ///
    /// An empty client id is replaced with [`DEFAULT_CLIENT_ID`] when the
    /// connect packet is built.
    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    /// Get current client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Update will message.
    pub fn set_will(&mut self, will: LastWill) -> &mut Self {
        self.will = Some(will);
        self
    }

    /// Get current will message.
    #[must_use]
    pub const fn will(&self) -> Option<&LastWill> {
        self.will.as_ref()
    }

    /// Update username.
    pub fn set_username(&mut self, username: &str) -> &mut Self {
        self.username = Some(username.to_string());
        self
    }

    /// Get current username.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Update password.
    pub fn set_password(&mut self, password: &[u8]) -> &mut Self {
        self.password = Some(password.to_vec());
        self
    }

    /// Get current password.
    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    /// Update clean-session flag.
    ///
    /// Session resumption is not supported: the engine forces a clean
    /// session regardless of this value.
    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    /// Get current clean-session flag.
    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }
}
