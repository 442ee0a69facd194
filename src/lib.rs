//! Host-side driver for the STMicroelectronics X-NUCLEO-LPM01A (PowerShield)
//! power-measurement board.
//!
//! The board is a USB virtual COM port at 3 686 400 baud that speaks a line
//! oriented command shell. Once `start` is acknowledged it streams current
//! (or energy) samples in one of two encodings until the acquisition ends:
//!
//! - `ascii_dec`: one `DDDDSZZ\r\n` line per sample, see [`ascii`].
//! - `bin_hexa`: two bytes per sample interleaved with `0xF0` metadata
//!   frames, see [`binary`].
//!
//! [`Connection`] owns the serial port on a background thread, routes bytes to
//! the response parser or the active decoder, and reports everything through an
//! [`Event`] channel.
//!
//! # Example
//! ```ignore
//! use powershield::{AcquisitionConfig, Command, Connection, Event};
//!
//! let (mut conn, events) = Connection::new();
//! conn.connect_port("/dev/ttyACM0")?;
//! let config = AcquisitionConfig::default();
//! for cmd in config.commands() {
//!     conn.send(&cmd);
//! }
//! conn.set_format(config.format);
//! conn.send(&Command::Start);
//! for event in events.iter() {
//!     if let Event::Data(batch) = event {
//!         println!("{} samples", batch.samples.len());
//!     }
//! }
//! ```

pub mod ascii;
pub mod batch;
pub mod binary;
pub mod commands;
pub mod config;
mod errors;
pub mod logging;
pub mod serial;
pub mod worker;

pub use ascii::AsciiDecoder;
pub use batch::{AckLine, DecodedBatch, Timestamp};
pub use binary::BinaryDecoder;
pub use commands::{Command, DataFormat, PendingCommand};
pub use config::AcquisitionConfig;
pub use errors::*;
pub use serial::{list_ports, open_port, SerialTransport, Transport, BAUD_RATE};
pub use worker::{Connection, ConnectionState, Event};
