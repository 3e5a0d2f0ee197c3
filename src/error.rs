/// Errors returned from the protocol engine, pacer, registry and session.
///
/// The variant names mirror the error taxonomy from the driver's design:
/// parse errors surface at construction, framing errors are logged and
/// swallowed by the decoder's resync loop, encoding errors surface
/// synchronously at the call site, transport errors are fatal for a
/// session, and timeouts and NAKs are per-call and non-fatal.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("I/O error: {0:?}")]
    IoError(::std::io::ErrorKind),

    #[error("Nom error: {0:?}")]
    NomError(nom::error::ErrorKind),

    /// An unrecognized opcode was seen on the wire. The decoder drops a
    /// single byte and resynchronizes from the next one.
    #[error("Framing error: unrecognized or malformed frame")]
    Framing,

    /// Caller-supplied extended user data exceeded 14 bytes.
    #[error("User data exceeds 14 bytes")]
    UserDataTooLong,

    /// An invalid [Address](crate::Address) string was passed to a
    /// constructor.
    #[error("Invalid address format. Expected 'xx.xx.xx'.")]
    InvalidAddress,

    /// The PLM responded to a submitted frame with a NAK.
    #[error("Command was not acknowledged")]
    NotAcknowledged,

    /// An expectation (e.g. a status request) was not satisfied in time.
    #[error("Operation timed out")]
    Timeout,

    /// An unexpected response shape was received for the operation in
    /// progress.
    #[error("Unexpected response received")]
    UnexpectedResponse,

    /// The underlying transport closed or failed; the session is no
    /// longer usable.
    #[error("Transport closed or failed")]
    Transport,

    /// The modem (or the channel to its owning task) was disconnected.
    #[error("Modem was disconnected.")]
    Disconnected,
}

impl From<::std::io::Error> for Error {
    fn from(e: ::std::io::Error) -> Error {
        Error::IoError(e.kind())
    }
}

impl From<nom::error::ErrorKind> for Error {
    fn from(e: nom::error::ErrorKind) -> Error {
        Error::NomError(e)
    }
}

impl From<futures::channel::mpsc::SendError> for Error {
    fn from(_: futures::channel::mpsc::SendError) -> Error {
        Error::Disconnected
    }
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Error {
        Error::Disconnected
    }
}
