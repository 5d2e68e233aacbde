// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Per-connection identity carried through proxy log lines.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One accepted client connection. Tunnels inherit the metadata of the
/// connection that issued the CONNECT.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub established: Instant,
}

impl ConnectionMetadata {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            established: Instant::now(),
        }
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.established.elapsed()
    }

    pub fn age_ms(&self) -> u128 {
        self.age().as_millis()
    }
}
