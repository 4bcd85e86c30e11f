//! # Stream Transform (RC4)
//!
//! Optional symmetric keystream XOR applied to session bytes after a key
//! exchange performed by the application.
//!
//! Each direction owns an independent RC4 generator. Both are seeded from the
//! token pair the peers exchanged and then advanced by [`RC4_DISCARD`] bytes,
//! dropping the biased start of the keystream.
//!
//! ## Ordering
//! The generators are stateful: `transform` must see outgoing bytes in the
//! exact order they hit the wire and `inverse` must see incoming bytes in the
//! exact order they were received. The session applies them inside its
//! single-writer and single-reader paths.
//!
//! ## Security
//! RC4 is obfuscation, not authenticated encryption. Use TLS where
//! confidentiality or integrity matter.

use std::fmt;

use crate::error::{ProtocolError, Result};

/// Keystream bytes dropped after key scheduling
pub const RC4_DISCARD: usize = 1536;

/// Length of a token generated by [`generate_token`]
pub const TOKEN_LENGTH: usize = 16;

/// RC4 keystream generator
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Run the key schedule. Keys must be 1..=256 bytes long.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() || key.len() > 256 {
            return Err(ProtocolError::Custom(format!(
                "RC4 key must be 1-256 bytes, got {}",
                key.len()
            )));
        }

        let mut state = [0u8; 256];
        for (k, slot) in state.iter_mut().enumerate() {
            *slot = k as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        Ok(Self { state, i: 0, j: 0 })
    }

    #[inline]
    pub fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        let k = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
        self.state[k as usize]
    }

    /// Advance the keystream by `n` bytes
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            self.next_byte();
        }
    }

    /// XOR the keystream into `data` in place
    pub fn apply(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.next_byte();
        }
    }
}

impl fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print keystream state
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}

/// Generate a random token for the key exchange
pub fn generate_token() -> Result<[u8; TOKEN_LENGTH]> {
    let mut token = [0u8; TOKEN_LENGTH];
    getrandom::fill(&mut token)
        .map_err(|e| ProtocolError::Custom(format!("Failed to generate token: {e}")))?;
    Ok(token)
}

/// Pair of independent keystreams, one per direction
#[derive(Debug, Clone)]
pub struct StreamTransform {
    outbound: Rc4,
    inbound: Rc4,
}

impl StreamTransform {
    /// Transform for the server end of a connection.
    ///
    /// Client-to-server bytes are keyed with `client_token || server_token`,
    /// server-to-client bytes with `server_token || client_token`.
    pub fn server(client_token: &[u8], server_token: &[u8]) -> Result<Self> {
        let upstream = [client_token, server_token].concat();
        let downstream = [server_token, client_token].concat();
        Ok(Self {
            outbound: Self::keystream(&downstream)?,
            inbound: Self::keystream(&upstream)?,
        })
    }

    /// Transform for the client end; mirrors [`StreamTransform::server`]
    pub fn client(client_token: &[u8], server_token: &[u8]) -> Result<Self> {
        let upstream = [client_token, server_token].concat();
        let downstream = [server_token, client_token].concat();
        Ok(Self {
            outbound: Self::keystream(&upstream)?,
            inbound: Self::keystream(&downstream)?,
        })
    }

    fn keystream(key: &[u8]) -> Result<Rc4> {
        let mut rc4 = Rc4::new(key)?;
        rc4.skip(RC4_DISCARD);
        Ok(rc4)
    }

    /// Obfuscate outgoing bytes in place
    pub fn transform(&mut self, data: &mut [u8]) {
        self.outbound.apply(data);
    }

    /// Recover incoming bytes in place
    pub fn inverse(&mut self, data: &mut [u8]) {
        self.inbound.apply(data);
    }

    /// Split into the (outbound, inbound) generators
    pub fn split(self) -> (Rc4, Rc4) {
        (self.outbound, self.inbound)
    }
}
