pub const START: u8 = 0x02u8;
pub const ACK: u8 = 0x06u8;
pub const NAK: u8 = 0x15u8;

// PLM -> Host commands
pub const STANDARD_INSTEON_RECV: u8 = 0x50u8;
pub const EXTENDED_INSTEON_RECV: u8 = 0x51u8;
pub const ALL_LINK_RECORD: u8 = 0x57u8;
pub const GET_IM_INFO: u8 = 0x60u8;

// Host -> PLM commands (also echoed back by the PLM)
pub const INSTEON_SEND: u8 = 0x62u8;
pub const GET_FIRST_ALL_LINK_RECORD: u8 = 0x69u8;
pub const GET_NEXT_ALL_LINK_RECORD: u8 = 0x6au8;

/// Default TCP port for a PLM exposed over the network.
pub const DEFAULT_TCP_PORT: u16 = 9761;

/// Default serial line settings: 19200 baud, 8 data bits, 1 stop bit,
/// no parity, no flow control.
pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// How long to wait for the PLM's own echo/ACK of a submitted frame.
/// This is a local, same-box round trip (no RF involved), so it is kept
/// short; a PLM that doesn't answer within this window is treated as
/// unresponsive rather than blocking the writer task forever.
pub const DEFAULT_REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// How long to wait for a device's direct-ack after a Status Request has
/// been echoed by the PLM. This one does cross the RF mesh, so it gets
/// the longer bound suggested by the design's open question (a).
pub const DEFAULT_EXPECTATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
