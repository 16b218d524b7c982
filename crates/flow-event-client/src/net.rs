// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Endpoint addressing and the non-blocking transport.
//!
//! The engine never blocks on the socket: reads are attempted with
//! `try_read` and a read that would block is reported as
//! [`ReadStatus::Timeout`], leaving the caller to wait for readiness
//! (usually via [`Transport::readable`]) and retry.

use crate::buffer::RecvBuffer;
use crate::errors::AddressError;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

// Cheap length check before handing "host:port" to the address parser.
const MIN_IPV4_ENDPOINT_LEN: usize = 7;

/// A distributor endpoint address.
///
/// Grammar: a bare path without a colon is a unix domain socket;
/// `host:port` with exactly one colon is IPv4; anything with more colons is
/// IPv6, bracketed as `[host]:port` when a port is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Inet(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(input: &str) -> Result<Self, AddressError> {
        if input.is_empty() {
            return Err(AddressError::Empty);
        }

        match input.matches(':').count() {
            0 => {
                #[cfg(unix)]
                {
                    Ok(Endpoint::Unix(PathBuf::from(input)))
                }
                #[cfg(not(unix))]
                {
                    Err(AddressError::InvalidHost(input.to_string()))
                }
            }
            1 => {
                if input.len() < MIN_IPV4_ENDPOINT_LEN {
                    return Err(AddressError::TooShort(input.to_string()));
                }
                let Some((host, port)) = input.rsplit_once(':') else {
                    return Err(AddressError::InvalidHost(input.to_string()));
                };
                let host: Ipv4Addr = host
                    .parse()
                    .map_err(|_| AddressError::InvalidHost(input.to_string()))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| AddressError::InvalidPort(input.to_string()))?;
                Ok(Endpoint::Inet(SocketAddr::new(IpAddr::V4(host), port)))
            }
            _ => {
                let (host, port) = if let Some(stripped) = input.strip_prefix('[') {
                    let Some((host, port)) = stripped.rsplit_once("]:") else {
                        return Err(AddressError::MismatchedBrackets(input.to_string()));
                    };
                    (host, port)
                } else {
                    let Some((host, port)) = input.rsplit_once(':') else {
                        return Err(AddressError::InvalidHost(input.to_string()));
                    };
                    (host, port)
                };
                let host: Ipv6Addr = host
                    .parse()
                    .map_err(|_| AddressError::InvalidHost(input.to_string()))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| AddressError::InvalidPort(input.to_string()))?;
                Ok(Endpoint::Inet(SocketAddr::new(IpAddr::V6(host), port)))
            }
        }
    }
}

impl Endpoint {
    /// Open a stream connection to this endpoint.
    pub async fn connect(&self) -> io::Result<Transport> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                debug!(path = %path.display(), "connecting to unix endpoint");
                Ok(Transport::Unix(UnixStream::connect(path).await?))
            }
            Endpoint::Inet(addr) => {
                debug!(%addr, "connecting to inet endpoint");
                Ok(Transport::Tcp(TcpStream::connect(addr).await?))
            }
        }
    }
}

/// Outcome of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes were appended to the buffer (zero when the buffer was already
    /// full).
    Ok(usize),
    /// The read would have blocked; wait for readiness and retry.
    Timeout,
    /// The daemon closed the connection.
    PeerDisconnect,
}

/// The stream the engine reads from.
pub enum Transport {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
    /// Replay transport for testing - yields a fixed byte stream, then EOF.
    #[allow(dead_code)]
    Replay(io::Cursor<Vec<u8>>),
}

impl Transport {
    /// Wait until the stream is readable. For the replay transport this is
    /// immediate.
    pub async fn readable(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(stream) => stream.readable().await,
            Transport::Tcp(stream) => stream.readable().await,
            Transport::Replay(_) => Ok(()),
        }
    }

    /// Attempt one non-blocking read into the buffer's spare capacity.
    pub fn read_into(&mut self, buffer: &mut RecvBuffer) -> io::Result<ReadStatus> {
        if buffer.is_full() {
            // A zero-length read would be indistinguishable from EOF.
            return Ok(ReadStatus::Ok(0));
        }
        let result = match self {
            #[cfg(unix)]
            Transport::Unix(stream) => stream.try_read(buffer.spare_mut()),
            Transport::Tcp(stream) => stream.try_read(buffer.spare_mut()),
            Transport::Replay(cursor) => cursor.read(buffer.spare_mut()),
        };

        match result {
            Ok(0) => Ok(ReadStatus::PeerDisconnect),
            Ok(count) => {
                buffer.advance(count);
                Ok(ReadStatus::Ok(count))
            }
            Err(error)
                if error.kind() == io::ErrorKind::WouldBlock
                    || error.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(ReadStatus::Timeout)
            }
            Err(error) => Err(error),
        }
    }
}
