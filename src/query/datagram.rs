//! Datagram query with retransmission.
//!
//! Sends an opaque request to one upstream over a non-blocking UDP socket and
//! waits for readability. Each attempt waits
//! [`QueryConfig::timeout_for_attempt`] milliseconds before the request is
//! sent again; after `attempts` sends the query fails with `TimedOut`. An
//! optional total budget caps the sum of expired attempt timeouts.
//!
//! A datagram is accepted only if it comes from the upstream address and its
//! first two octets (the message ID) match the request. Anything else is
//! discarded and the wait continues until the attempt's original deadline.
//! An accepted datagram longer than `max_response_size` is cut to that size
//! and reported as truncated.
//!
//! # Cancel Safety
//!
//! Cancelling drops the socket; a late answer is discarded by the kernel.

use crate::config::{LoopConfig, QueryConfig};
use crate::error::{Error, Result};
use crate::eventloop::{Descriptor, TIMEOUT_FOREVER};
use crate::scheduler::{Operation, Step, Wait};
use crate::tracing_compat::{debug, trace};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;

/// Flag bit in the third octet marking a truncated response.
const TRUNCATION_FLAG: u8 = 0x02;

/// An accepted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramResponse {
    /// Raw response octets.
    pub bytes: Vec<u8>,
    /// Number of times the request was sent.
    pub attempts: u32,
    /// Address the response came from.
    pub from: SocketAddr,
    /// Whether the upstream set the truncation flag or the datagram exceeded
    /// `max_response_size`.
    pub truncated: bool,
}

/// UDP request/response exchange driven by the scheduler.
#[derive(Debug)]
pub struct DatagramQuery {
    socket: UdpSocket,
    upstream: SocketAddr,
    request: Vec<u8>,
    config: QueryConfig,
    attempts: u32,
    total_timeout_ms: u64,
    spent_ms: u64,
    current_timeout_ms: u64,
}

impl DatagramQuery {
    /// Creates a query on a fresh ephemeral socket of the upstream's family.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `request` is shorter than a message ID; `Io` if
    /// the socket cannot be bound or made non-blocking.
    pub fn new(upstream: SocketAddr, request: Vec<u8>, config: QueryConfig) -> Result<Self> {
        let local: SocketAddr = if upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        Self::with_socket(socket, upstream, request, config)
    }

    /// Creates a query using `config.query` for retransmission and
    /// `config.default_timeout_ms` as the total budget.
    ///
    /// # Errors
    ///
    /// As for [`new`](Self::new).
    pub fn from_config(upstream: SocketAddr, request: Vec<u8>, config: &LoopConfig) -> Result<Self> {
        Ok(Self::new(upstream, request, config.query.clone())?
            .with_total_timeout(config.default_timeout_ms))
    }

    /// Creates a query on a caller-supplied socket.
    ///
    /// # Errors
    ///
    /// As for [`new`](Self::new).
    pub fn with_socket(
        socket: UdpSocket,
        upstream: SocketAddr,
        request: Vec<u8>,
        config: QueryConfig,
    ) -> Result<Self> {
        if request.len() < 2 {
            return Err(Error::invalid_parameter(
                "request is too short to carry a message id",
            ));
        }
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            upstream,
            request,
            config,
            attempts: 0,
            total_timeout_ms: TIMEOUT_FOREVER,
            spent_ms: 0,
            current_timeout_ms: 0,
        })
    }

    /// Caps the sum of expired attempt timeouts at `ms`.
    ///
    /// The last attempt's wait is shortened to fit the remaining budget.
    #[must_use]
    pub fn with_total_timeout(mut self, ms: u64) -> Self {
        self.total_timeout_ms = ms;
        self
    }

    /// Descriptor the query waits on.
    #[must_use]
    pub fn descriptor(&self) -> Descriptor {
        self.socket.as_raw_fd()
    }

    /// Local address of the query socket.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of sends so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn message_id(&self) -> [u8; 2] {
        [self.request[0], self.request[1]]
    }

    fn remaining_budget(&self) -> u64 {
        self.total_timeout_ms.saturating_sub(self.spent_ms)
    }

    fn current_wait(&mut self) -> Wait {
        let attempt = self.attempts.saturating_sub(1);
        self.current_timeout_ms = self
            .config
            .timeout_for_attempt(attempt)
            .min(self.remaining_budget());
        Wait::readable(self.descriptor(), self.current_timeout_ms)
    }

    /// Waits again for the current attempt without moving its deadline.
    fn rewait(&self) -> Wait {
        Wait::readable(self.descriptor(), self.current_timeout_ms).keep_deadline()
    }

    fn transmit(&mut self) -> Step<DatagramResponse> {
        match self.socket.send_to(&self.request, self.upstream) {
            Ok(_) => {
                self.attempts += 1;
                trace!(
                    upstream = %self.upstream,
                    attempt = self.attempts,
                    "request sent"
                );
                Step::Wait(self.current_wait())
            }
            Err(err) => Step::fail(Error::from(err)),
        }
    }

    fn accepts(&self, from: SocketAddr, datagram: &[u8]) -> bool {
        from == self.upstream && datagram.len() >= 2 && datagram[..2] == self.message_id()
    }
}

impl Operation for DatagramQuery {
    type Output = DatagramResponse;

    fn start(&mut self) -> Step<DatagramResponse> {
        self.transmit()
    }

    fn on_readable(&mut self, _fd: Descriptor) -> Step<DatagramResponse> {
        let limit = self.config.max_response_size;
        // One spare octet tells an oversized datagram from one that fits.
        let mut buf = vec![0u8; limit.saturating_add(1)];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if !self.accepts(from, &buf[..len]) {
                        trace!(%from, len, "discarding unrelated datagram");
                        continue;
                    }
                    let oversized = len > limit;
                    buf.truncate(len.min(limit));
                    let truncated =
                        oversized || buf.get(2).is_some_and(|b| b & TRUNCATION_FLAG != 0);
                    debug!(
                        upstream = %from,
                        len,
                        attempts = self.attempts,
                        truncated,
                        oversized,
                        "response accepted"
                    );
                    return Step::done(DatagramResponse {
                        bytes: buf,
                        attempts: self.attempts,
                        from,
                        truncated,
                    });
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Step::Wait(self.rewait());
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Step::fail(Error::from(err)),
            }
        }
    }

    fn on_timeout(&mut self) -> Step<DatagramResponse> {
        self.spent_ms = self.spent_ms.saturating_add(self.current_timeout_ms);
        if self.attempts >= self.config.attempts || self.remaining_budget() == 0 {
            debug!(upstream = %self.upstream, attempts = self.attempts, "query gave up");
            return Step::fail(Error::timed_out(self.attempts));
        }
        self.transmit()
    }
}
