// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Channel driven MQTT 3.1.1 client engine.
//!
//! The engine is split in two halves connected by a control channel:
//! * [`Client`], a cheap clonable handle with one blocking entry point per
//!   control verb: connect, disconnect, ping, publish, subscribe and
//!   unsubscribe.
//! * [`EventLoop`], which owns the transport endpoints and the connection
//!   state, and serializes application requests against packets pushed by
//!   the server.
//!
//! The transport is supplied by the application as a pair of
//! `AsyncRead`/`AsyncWrite` endpoints; establishing the byte stream, TLS
//! and reconnection are out of scope. Messages published by the server are
//! delivered through the [`PublishHandler`] callback, errors through the
//! [`ErrorHandler`] callback.
//!
//! ```ignore
//! use qilin::{Client, ConnectOptions, EventLoop, Message, QoS};
//!
//! let stream = tokio::net::TcpStream::connect("localhost:1883").await?;
//! let (rx, tx) = stream.into_split();
//! let (client, event_loop) = EventLoop::new("demo", rx, tx, Box::new(handler));
//! tokio::spawn(event_loop.run());
//!
//! client.connect(ConnectOptions::new()).await?;
//! client.subscribe(Message::new("greeting/#", QoS::AtMostOnce, b"")).await?;
//! client.publish(Message::new("greeting/hi", QoS::AtLeastOnce, b"hello")).await?;
//! ```

mod client;
mod commands;
mod connect_options;
mod error;
mod event_loop;
mod handler;
mod message;
mod status;

pub use client::Client;
pub use codec::QoS;
pub use connect_options::{ConnectOptions, LastWill, DEFAULT_CLIENT_ID, KEEP_ALIVE};
pub use error::{Error, ErrorKind};
pub use event_loop::{EventLoop, DEFAULT_MAX_TOPIC_LEN};
pub use handler::{ErrorHandler, LogErrorHandler, PayloadReader, PublishHandler};
pub use message::Message;
pub use status::ClientStatus;
