//! Guacamole protocol status codes.
//!
//! Every status carries three codes: the HTTP status used by the long-poll
//! tunnel, the WebSocket close code, and the numeric Guacamole status sent
//! to the client (in `error` instructions and WebSocket close reasons).

use crate::Error;

/// All known protocol statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation succeeded.
    Success,
    /// The requested operation is unsupported.
    Unsupported,
    /// An internal error occurred, and the operation could not complete.
    ServerError,
    /// The server is busy and cannot accept the operation.
    ServerBusy,
    /// The upstream server (guacd or the remote desktop) is not responding.
    UpstreamTimeout,
    /// The upstream server returned an error.
    UpstreamError,
    /// The requested resource does not exist.
    ResourceNotFound,
    /// The requested resource is already in use.
    ResourceConflict,
    /// The requested resource is now closed.
    ResourceClosed,
    /// The upstream server does not appear to exist.
    UpstreamNotFound,
    /// The upstream server is refusing service.
    UpstreamUnavailable,
    /// The session conflicted with another session.
    SessionConflict,
    /// The session appeared to be inactive.
    SessionTimeout,
    /// The session was forcibly terminated.
    SessionClosed,
    /// The operation could not be performed because of bad parameters.
    ClientBadRequest,
    /// Permission was denied because the user is not logged in.
    ClientUnauthorized,
    /// Permission was denied and logging in will not help.
    ClientForbidden,
    /// The client took too long to respond.
    ClientTimeout,
    /// The client sent too much data.
    ClientOverrun,
    /// The client sent data of an unsupported or unexpected type.
    ClientBadType,
    /// Too many connections or sessions from this client.
    ClientTooMany,
}

/// (status, HTTP status, WebSocket close code, Guacamole status)
const TABLE: [(Status, u16, u16, u16); 21] = [
    (Status::Success, 200, 1000, 0x0000),
    (Status::Unsupported, 501, 4256, 0x0100),
    (Status::ServerError, 500, 4512, 0x0200),
    (Status::ServerBusy, 503, 4513, 0x0201),
    (Status::UpstreamTimeout, 504, 4514, 0x0202),
    (Status::UpstreamError, 502, 4515, 0x0203),
    (Status::ResourceNotFound, 404, 4516, 0x0204),
    (Status::ResourceConflict, 409, 4517, 0x0205),
    (Status::ResourceClosed, 404, 4518, 0x0206),
    (Status::UpstreamNotFound, 502, 4519, 0x0207),
    (Status::UpstreamUnavailable, 502, 4520, 0x0208),
    (Status::SessionConflict, 409, 4521, 0x0209),
    (Status::SessionTimeout, 408, 4522, 0x020A),
    (Status::SessionClosed, 404, 4523, 0x020B),
    (Status::ClientBadRequest, 400, 4768, 0x0300),
    (Status::ClientUnauthorized, 403, 4769, 0x0301),
    (Status::ClientForbidden, 403, 4771, 0x0303),
    (Status::ClientTimeout, 408, 4776, 0x0308),
    (Status::ClientOverrun, 413, 4781, 0x030D),
    (Status::ClientBadType, 415, 4783, 0x030F),
    (Status::ClientTooMany, 429, 4797, 0x031D),
];

impl Status {
    fn row(self) -> (Status, u16, u16, u16) {
        // The table is exhaustive over the enum.
        TABLE
            .iter()
            .copied()
            .find(|row| row.0 == self)
            .unwrap_or(TABLE[2])
    }

    /// HTTP status code used by the long-poll tunnel.
    pub fn http_code(self) -> u16 {
        self.row().1
    }

    /// WebSocket close code.
    pub fn websocket_code(self) -> u16 {
        self.row().2
    }

    /// Numeric Guacamole protocol status.
    pub fn guacamole_code(self) -> u16 {
        self.row().3
    }

    /// Reverse lookup from a numeric Guacamole protocol status.
    pub fn from_guacamole_code(code: u16) -> Option<Status> {
        TABLE.iter().find(|row| row.3 == code).map(|row| row.0)
    }

    /// True for the 0x03xx range, statuses caused by the client.
    pub fn is_client_error(self) -> bool {
        (0x0300..0x0400).contains(&self.guacamole_code())
    }

    /// Build the error corresponding to this status.
    pub fn to_error(self, message: impl Into<String>) -> Error {
        let message = message.into();
        match self {
            Status::ResourceNotFound => Error::NotFound(message),
            Status::ResourceClosed => Error::ConnectionClosed(message),
            Status::ServerError | Status::Success => Error::Server(message),
            status if status.is_client_error() => Error::Client { status, message },
            status => Error::Upstream { status, message },
        }
    }
}
