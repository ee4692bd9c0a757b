//! NTLM session security for WinRM over plain HTTP.
//!
//! After the AUTHENTICATE leg has exchanged a session key, each SOAP body is
//! RC4-sealed and HMAC-signed, then framed as `multipart/encrypted`:
//!
//! ```text
//! --Encrypted Boundary\r\n
//! \tContent-Type: application/HTTP-SPNEGO-session-encrypted\r\n
//! \tOriginalContent: type=application/soap+xml;charset=UTF-8;Length=<n>\r\n
//! --Encrypted Boundary\r\n
//! \tContent-Type: application/octet-stream\r\n
//! <u32 LE signature length><signature><sealed body>--Encrypted Boundary--\r\n
//! ```
//!
//! The RC4 state of each direction carries over from one message to the
//! next, so a context must see its messages in order.

use md5::{Digest, Md5};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::bridge::error::BridgeError;
use crate::bridge::types::TransportCause;

use super::ntlm::hmac_md5;

const CLIENT_SIGN_MAGIC: &[u8] = b"session key to client-to-server signing key magic constant\0";
const CLIENT_SEAL_MAGIC: &[u8] = b"session key to client-to-server sealing key magic constant\0";
const SERVER_SIGN_MAGIC: &[u8] = b"session key to server-to-client signing key magic constant\0";
const SERVER_SEAL_MAGIC: &[u8] = b"session key to server-to-client sealing key magic constant\0";

const BOUNDARY: &[u8] = b"--Encrypted Boundary";
const PART_HEADER: &[u8] = b"\tContent-Type: application/HTTP-SPNEGO-session-encrypted\r\n";
const STREAM_HEADER: &[u8] = b"\tContent-Type: application/octet-stream\r\n";
const LENGTH_MARKER: &[u8] = b"Length=";

const SIGNATURE_LEN: usize = 16;
const SIGNATURE_VERSION: u32 = 1;

fn protocol(message: impl Into<String>) -> BridgeError {
    BridgeError::transport(TransportCause::Protocol, message)
}

/// RC4 keystream.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub(crate) fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, slot) in state.iter_mut().enumerate() {
            *slot = i as u8;
        }
        if !key.is_empty() {
            let mut j: u8 = 0;
            for i in 0..256 {
                j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
                state.swap(i, j as usize);
            }
        }
        Self { state, i: 0, j: 0 }
    }

    /// Encrypt or decrypt `data` in place.
    pub(crate) fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *byte ^= self.state[k as usize];
        }
    }
}

fn derive_key(session_key: &[u8; 16], magic: &[u8]) -> Zeroizing<[u8; 16]> {
    let mut hasher = Md5::new();
    hasher.update(session_key);
    hasher.update(magic);
    let mut key = Zeroizing::new([0u8; 16]);
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Keys and sequence number for one direction of a context.
struct Direction {
    sign_key: Zeroizing<[u8; 16]>,
    seal: Rc4,
    seq: u32,
}

impl Direction {
    fn new(session_key: &[u8; 16], sign_magic: &[u8], seal_magic: &[u8]) -> Self {
        let seal_key = derive_key(session_key, seal_magic);
        Self {
            sign_key: derive_key(session_key, sign_magic),
            seal: Rc4::new(seal_key.as_slice()),
            seq: 0,
        }
    }

    /// Signature over `plaintext` at the current sequence number.
    fn mac(&mut self, plaintext: &[u8]) -> Result<[u8; SIGNATURE_LEN], BridgeError> {
        let mut input = Vec::with_capacity(4 + plaintext.len());
        input.extend_from_slice(&self.seq.to_le_bytes());
        input.extend_from_slice(plaintext);
        let digest = hmac_md5(self.sign_key.as_slice(), &input)?;

        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&digest[..8]);
        self.seal.apply(&mut checksum);

        let mut signature = [0u8; SIGNATURE_LEN];
        signature[..4].copy_from_slice(&SIGNATURE_VERSION.to_le_bytes());
        signature[4..12].copy_from_slice(&checksum);
        signature[12..].copy_from_slice(&self.seq.to_le_bytes());
        self.seq = self.seq.wrapping_add(1);
        Ok(signature)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<([u8; SIGNATURE_LEN], Vec<u8>), BridgeError> {
        let mut sealed = plaintext.to_vec();
        self.seal.apply(&mut sealed);
        let signature = self.mac(plaintext)?;
        Ok((signature, sealed))
    }

    fn unseal(&mut self, signature: &[u8], sealed: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let mut plaintext = sealed.to_vec();
        self.seal.apply(&mut plaintext);
        let expected = self.mac(&plaintext)?;
        if expected[..] != signature[..] {
            return Err(protocol("sealed WinRM reply failed its NTLM signature check"));
        }
        Ok(plaintext)
    }
}

/// An established NTLM security context on one connection.
pub(crate) struct SecurityContext {
    outbound: Direction,
    inbound: Direction,
}

impl SecurityContext {
    /// Client end of the context keyed by the exported session key.
    pub(crate) fn client(session_key: &[u8; 16]) -> Self {
        Self {
            outbound: Direction::new(session_key, CLIENT_SIGN_MAGIC, CLIENT_SEAL_MAGIC),
            inbound: Direction::new(session_key, SERVER_SIGN_MAGIC, SERVER_SEAL_MAGIC),
        }
    }

    /// Server end of the context, used by the scripted endpoint.
    #[cfg(test)]
    pub(crate) fn server(session_key: &[u8; 16]) -> Self {
        Self {
            outbound: Direction::new(session_key, SERVER_SIGN_MAGIC, SERVER_SEAL_MAGIC),
            inbound: Direction::new(session_key, CLIENT_SIGN_MAGIC, CLIENT_SEAL_MAGIC),
        }
    }

    /// Seal `plaintext` and frame it for the wire.
    pub(crate) fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let (signature, sealed) = self.outbound.seal(plaintext)?;
        Ok(frame(&signature, &sealed, plaintext.len()))
    }

    /// Unframe, unseal and verify a body sealed by the peer.
    pub(crate) fn unwrap(&mut self, framed: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let (length, payload) = unframe(framed)?;
        let signature_len = payload
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| protocol("sealed WinRM body is truncated"))?;
        if signature_len != SIGNATURE_LEN || payload.len() < 4 + SIGNATURE_LEN {
            return Err(protocol(format!(
                "sealed WinRM body has a {}-byte signature",
                signature_len
            )));
        }
        let signature = &payload[4..4 + SIGNATURE_LEN];
        let sealed = &payload[4 + SIGNATURE_LEN..];
        let plaintext = self.inbound.unseal(signature, sealed)?;
        if plaintext.len() != length {
            return Err(protocol(format!(
                "sealed WinRM body declares {} bytes but holds {}",
                length,
                plaintext.len()
            )));
        }
        Ok(plaintext)
    }
}

fn frame(signature: &[u8; SIGNATURE_LEN], sealed: &[u8], original_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + sealed.len());
    out.extend_from_slice(BOUNDARY);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(PART_HEADER);
    out.extend_from_slice(
        format!(
            "\tOriginalContent: type=application/soap+xml;charset=UTF-8;Length={}\r\n",
            original_len
        )
        .as_bytes(),
    );
    out.extend_from_slice(BOUNDARY);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(STREAM_HEADER);
    out.extend_from_slice(&(SIGNATURE_LEN as u32).to_le_bytes());
    out.extend_from_slice(signature);
    out.extend_from_slice(sealed);
    out.extend_from_slice(BOUNDARY);
    out.extend_from_slice(b"--\r\n");
    out
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|at| at + from)
}

/// Declared plaintext length and the signed payload of a framed body.
fn unframe(framed: &[u8]) -> Result<(usize, &[u8]), BridgeError> {
    let malformed = || protocol("malformed multipart/encrypted WinRM body");

    let length_at = find(framed, LENGTH_MARKER, 0).ok_or_else(malformed)? + LENGTH_MARKER.len();
    let length_end = find(framed, b"\r\n", length_at).ok_or_else(malformed)?;
    let length = std::str::from_utf8(&framed[length_at..length_end])
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or_else(malformed)?;

    let start = find(framed, STREAM_HEADER, length_end).ok_or_else(malformed)? + STREAM_HEADER.len();
    let mut trailer = BOUNDARY.to_vec();
    trailer.extend_from_slice(b"--\r\n");
    let end = if framed.ends_with(&trailer) {
        framed.len() - trailer.len()
    } else if framed.ends_with(&trailer[..trailer.len() - 2]) {
        framed.len() - trailer.len() + 2
    } else {
        return Err(malformed());
    };
    let payload = framed.get(start..end).ok_or_else(malformed)?;
    Ok((length, payload))
}
