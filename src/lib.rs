#![recursion_limit = "256"]

//! A driver for talking to INSTEON™ home automation devices through an
//! attached PowerLinc Modem (PLM): a byte-oriented serial/TCP device that
//! relays framed commands and asynchronous reports between the host and
//! the INSTEON RF/powerline mesh.
//!
//! # Example
//! ```no_run
//! # use std::str::FromStr;
//! # use plm::{Address, Session};
//! # use plm::Error;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error>  {
//! // Connect to the modem attached to /dev/ttyUSB0 and turn on the
//! // switch at address 11.22.33.
//! let session = Session::connect_serial("/dev/ttyUSB0")?;
//! let device = session.device(Address::from_str("11.22.33")?);
//! device.send_on(0xff, None).await?;
//! # Ok(())
//! # }
//! ```

mod address;
mod constants;
mod error;
mod frame;
mod pacer;
mod registry;
mod session;
mod transport;

pub use address::{Address, MessageFlags, MessageType};
pub use error::Error;
pub use frame::{AllLinkFlags, AllLinkRecord, AllLinkWalkStep, Frame};
pub use pacer::Pacer;
pub use registry::DeviceStatus;
pub use session::{DeviceHandle, ManualChangeDirection, ModemInfo, Session};
