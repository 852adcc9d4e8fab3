//! Built-in operations.
//!
//! | Operation | Waits on | Output |
//! |-----------|----------|--------|
//! | [`Delay`] | a deadline | the delay in ms |
//! | [`DatagramQuery`] | a UDP socket, with retransmission | [`DatagramResponse`] |
//!
//! Message contents are opaque apart from the two-octet message ID at the
//! start of every request and response, and the truncation flag.

pub mod delay;
#[cfg(unix)]
pub mod datagram;

pub use delay::Delay;
#[cfg(unix)]
pub use datagram::{DatagramQuery, DatagramResponse};
