// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use tokio::sync::oneshot;

use crate::connect_options::ConnectOptions;
use crate::error::Error;
use crate::message::Message;

/// Sender half used by the event loop to answer a blocked caller.
pub(crate) type ReplySender = oneshot::Sender<Result<(), Error>>;

/// Control requests sent from application tasks to the event loop.
///
/// Each request carries the reply sender its caller is blocked on.
#[derive(Debug)]
pub(crate) enum ControlCmd {
    Connect {
        options: ConnectOptions,
        reply: ReplySender,
    },
    Disconnect {
        reply: ReplySender,
    },
    Ping {
        reply: ReplySender,
    },
    Publish {
        message: Message,
        reply: ReplySender,
    },
    Subscribe {
        message: Message,
        reply: ReplySender,
    },
    Unsubscribe {
        message: Message,
        reply: ReplySender,
    },
}

/// Type of the request currently waiting for a server acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InFlightKind {
    Connect,
    Ping,
    Publish,
    Subscribe,
    Unsubscribe,
}

/// The single outstanding request slot.
///
/// Correlation of server acknowledgements is positional: with at most one
/// request on the wire, the next matching acknowledgement answers `reply`.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub kind: InFlightKind,
    pub reply: ReplySender,
}
