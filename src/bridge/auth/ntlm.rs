//! NTLMv2 carried in the HTTP `Negotiate` scheme.
//!
//! Every request runs a fresh exchange on the channel:
//!
//! 1. NEGOTIATE (type 1) with an empty body
//! 2. CHALLENGE (type 2) in the server's 401 `WWW-Authenticate` header
//! 3. AUTHENTICATE (type 3), carrying a freshly exchanged session key
//!
//! Over TLS the SOAP body rides on the AUTHENTICATE request. Over plain HTTP
//! the AUTHENTICATE request goes out empty and the body follows as a sealed
//! `multipart/encrypted` message (see [`super::sealing`]).
//!
//! NTLM authenticates the TCP connection, not the request: every leg must
//! travel on the same socket. A server that announces `Connection: close`
//! between legs breaks the exchange, and that is reported as a transport
//! failure rather than as rejected credentials.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use tracing::trace;
use zeroize::Zeroizing;

use crate::bridge::error::BridgeError;
use crate::bridge::transport::{Channel, Exchange, Reply};
use crate::bridge::types::{AuthScheme, Credential, TransportCause};

use super::sealing::{Rc4, SecurityContext};
use super::traits::AuthStrategy;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_SIGN: u32 = 0x0000_0010;
const NEGOTIATE_SEAL: u32 = 0x0000_0020;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_KEY_EXCH: u32 = 0x4000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

/// Flags a server must grant before bodies can be sealed
const SEALING_FLAGS: u32 = NEGOTIATE_SIGN | NEGOTIATE_SEAL | NEGOTIATE_KEY_EXCH;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_SIGN
    | NEGOTIATE_SEAL
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_128
    | NEGOTIATE_KEY_EXCH
    | NEGOTIATE_56;

/// AV pair id carrying the server's FILETIME
const AV_TIMESTAMP: u16 = 7;
const AV_EOL: u16 = 0;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

const AUTHENTICATE_HEADER_LEN: usize = 64;

fn protocol(message: impl Into<String>) -> BridgeError {
    BridgeError::transport(TransportCause::Protocol, message)
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Payload referenced by the security buffer descriptor at `at`.
fn security_buffer(bytes: &[u8], at: usize) -> Option<&[u8]> {
    let len = read_u16(bytes, at)? as usize;
    let offset = read_u32(bytes, at + 4)? as usize;
    bytes.get(offset..offset.checked_add(len)?)
}

fn push_security_buffer(header: &mut Vec<u8>, len: u16, offset: u32) {
    header.extend_from_slice(&len.to_le_bytes());
    header.extend_from_slice(&len.to_le_bytes());
    header.extend_from_slice(&offset.to_le_bytes());
}

/// Length of an AUTHENTICATE field, which must fit a 16-bit descriptor.
fn field_len(field: &[u8], name: &str) -> Result<u16, BridgeError> {
    u16::try_from(field.len()).map_err(|_| {
        protocol(format!(
            "NTLM {} is {} bytes, beyond the 65535-byte message limit",
            name,
            field.len()
        ))
    })
}

fn field_offset(offset: usize) -> Result<u32, BridgeError> {
    u32::try_from(offset).map_err(|_| protocol("NTLM message exceeds 4 GiB"))
}

pub(crate) fn hmac_md5(key: &[u8], data: &[u8]) -> Result<[u8; 16], BridgeError> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|e| protocol(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Split `DOMAIN\user` into its parts. Any other form, including
/// `user@domain`, is sent as the user name with an empty domain.
pub(crate) fn split_principal(principal: &str) -> (&str, &str) {
    match principal.split_once('\\') {
        Some((domain, user)) => (domain, user),
        None => ("", principal),
    }
}

/// NTOWFv2: HMAC-MD5 keyed with MD4(password) over uppercase(user) + domain.
pub(crate) fn nt_owf_v2(password: &str, user: &str, domain: &str) -> Result<[u8; 16], BridgeError> {
    let password = Zeroizing::new(utf16le(password));
    let mut nt_hash = Zeroizing::new([0u8; 16]);
    nt_hash.copy_from_slice(&Md4::digest(password.as_slice()));

    let mut identity = utf16le(&user.to_uppercase());
    identity.extend_from_slice(&utf16le(domain));
    hmac_md5(nt_hash.as_slice(), &identity)
}

/// Current time as a Windows FILETIME.
fn filetime_now() -> u64 {
    let now = Utc::now();
    let secs = (now.timestamp() + FILETIME_EPOCH_OFFSET_SECS).max(0) as u64;
    secs * 10_000_000 + u64::from(now.timestamp_subsec_nanos() / 100)
}

/// The 32-byte NEGOTIATE message; no domain or workstation is supplied.
pub(crate) fn negotiate_message() -> Vec<u8> {
    let mut message = Vec::with_capacity(32);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&1u32.to_le_bytes());
    message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
    push_security_buffer(&mut message, 0, 0);
    push_security_buffer(&mut message, 0, 0);
    message
}

/// Decoded CHALLENGE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl Challenge {
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self, BridgeError> {
        if bytes.len() < 32 || &bytes[..8] != SIGNATURE {
            return Err(protocol("NTLM challenge is not an NTLMSSP message"));
        }
        if read_u32(bytes, 8) != Some(2) {
            return Err(protocol("NTLM challenge has the wrong message type"));
        }
        let flags = read_u32(bytes, 20).ok_or_else(|| protocol("NTLM challenge truncated"))?;
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&bytes[24..32]);

        let target_info = if bytes.len() >= 48 {
            security_buffer(bytes, 40)
                .ok_or_else(|| protocol("NTLM target info out of bounds"))?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// Whether the server granted signing, sealing and key exchange.
    pub(crate) fn grants_sealing(&self) -> bool {
        self.flags & SEALING_FLAGS == SEALING_FLAGS
    }

    /// Server FILETIME from the target info, if present.
    pub(crate) fn timestamp(&self) -> Option<u64> {
        let info = &self.target_info;
        let mut at = 0;
        while let (Some(id), Some(len)) = (read_u16(info, at), read_u16(info, at + 2)) {
            let value = info.get(at + 4..at + 4 + len as usize)?;
            match id {
                AV_EOL => return None,
                AV_TIMESTAMP if value.len() == 8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(value);
                    return Some(u64::from_le_bytes(raw));
                }
                _ => {}
            }
            at += 4 + len as usize;
        }
        None
    }
}

/// NTLMv2 response: NTProofStr followed by the client blob.
pub(crate) fn ntlmv2_response(
    response_key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Result<Vec<u8>, BridgeError> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);

    let mut proof_input = server_challenge.to_vec();
    proof_input.extend_from_slice(&blob);
    let proof = hmac_md5(response_key, &proof_input)?;

    let mut response = proof.to_vec();
    response.extend_from_slice(&blob);
    Ok(response)
}

fn lmv2_response(
    response_key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>, BridgeError> {
    let mut input = server_challenge.to_vec();
    input.extend_from_slice(client_challenge);
    let mut response = hmac_md5(response_key, &input)?.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}

/// An AUTHENTICATE message and the session key it establishes.
pub(crate) struct Authentication {
    pub message: Vec<u8>,
    /// Exported session key the security context is keyed by
    pub session_key: Zeroizing<[u8; 16]>,
}

/// Build the AUTHENTICATE message answering `challenge`.
///
/// When the server grants key exchange, `random_session_key` becomes the
/// exported session key and travels RC4-encrypted under the key exchange
/// key.
pub(crate) fn authenticate_message(
    credential: &Credential,
    challenge: &Challenge,
    client_challenge: [u8; 8],
    random_session_key: [u8; 16],
) -> Result<Authentication, BridgeError> {
    let (domain, user) = split_principal(credential.principal());
    let key = Zeroizing::new(nt_owf_v2(credential.expose_secret(), user, domain)?);
    let timestamp = challenge.timestamp().unwrap_or_else(filetime_now);

    let nt = ntlmv2_response(
        &key,
        &challenge.server_challenge,
        &client_challenge,
        timestamp,
        &challenge.target_info,
    )?;
    let lm = lmv2_response(&key, &challenge.server_challenge, &client_challenge)?;
    let key_exchange_key = Zeroizing::new(hmac_md5(key.as_slice(), &nt[..16])?);

    let flags = (challenge.flags & CLIENT_FLAGS) | NEGOTIATE_UNICODE | NEGOTIATE_NTLM;
    let (session_key, encrypted_key) = if flags & NEGOTIATE_KEY_EXCH != 0 {
        let mut encrypted = random_session_key.to_vec();
        Rc4::new(key_exchange_key.as_slice()).apply(&mut encrypted);
        (Zeroizing::new(random_session_key), encrypted)
    } else {
        (key_exchange_key, Vec::new())
    };

    let domain = utf16le(domain);
    let user = utf16le(user);

    let domain_offset = AUTHENTICATE_HEADER_LEN;
    let user_offset = domain_offset + domain.len();
    let workstation_offset = user_offset + user.len();
    let lm_offset = workstation_offset;
    let nt_offset = lm_offset + lm.len();
    let key_offset = nt_offset + nt.len();
    let end = key_offset + encrypted_key.len();

    let mut message = Vec::with_capacity(end);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&3u32.to_le_bytes());
    push_security_buffer(&mut message, field_len(&lm, "LM response")?, field_offset(lm_offset)?);
    push_security_buffer(&mut message, field_len(&nt, "NT response")?, field_offset(nt_offset)?);
    push_security_buffer(&mut message, field_len(&domain, "domain")?, field_offset(domain_offset)?);
    push_security_buffer(&mut message, field_len(&user, "user name")?, field_offset(user_offset)?);
    push_security_buffer(&mut message, 0, field_offset(workstation_offset)?);
    push_security_buffer(
        &mut message,
        field_len(&encrypted_key, "session key")?,
        field_offset(key_offset)?,
    );
    message.extend_from_slice(&flags.to_le_bytes());

    message.extend_from_slice(&domain);
    message.extend_from_slice(&user);
    message.extend_from_slice(&lm);
    message.extend_from_slice(&nt);
    message.extend_from_slice(&encrypted_key);
    Ok(Authentication {
        message,
        session_key,
    })
}

/// Check an AUTHENTICATE message against the expected password and recover
/// the exported session key. Server side of the exchange, used by the
/// scripted endpoint.
#[cfg(test)]
pub(crate) fn accept_authenticate(
    message: &[u8],
    server_challenge: &[u8; 8],
    password: &str,
) -> Option<Zeroizing<[u8; 16]>> {
    fn utf16_string(bytes: &[u8]) -> Option<String> {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|p| u16::from_le_bytes([p[0], p[1]]))
            .collect();
        String::from_utf16(&units).ok()
    }

    if message.len() < AUTHENTICATE_HEADER_LEN
        || &message[..8] != SIGNATURE
        || read_u32(message, 8) != Some(3)
    {
        return None;
    }
    let nt = security_buffer(message, 20)?;
    let domain = security_buffer(message, 28).and_then(utf16_string)?;
    let user = security_buffer(message, 36).and_then(utf16_string)?;
    let encrypted_key = security_buffer(message, 52)?;
    let flags = read_u32(message, 60)?;
    if nt.len() < 16 {
        return None;
    }
    let key = nt_owf_v2(password, &user, &domain).ok()?;
    let mut input = server_challenge.to_vec();
    input.extend_from_slice(&nt[16..]);
    let proof = hmac_md5(&key, &input).ok()?;
    if proof[..] != nt[..16] {
        return None;
    }

    let mut session_key = Zeroizing::new(hmac_md5(&key, &proof).ok()?);
    if flags & NEGOTIATE_KEY_EXCH != 0 && encrypted_key.len() == 16 {
        let mut exported = [0u8; 16];
        exported.copy_from_slice(encrypted_key);
        Rc4::new(session_key.as_slice()).apply(&mut exported);
        session_key = Zeroizing::new(exported);
    }
    Some(session_key)
}

fn leg_dropped(leg: &str) -> BridgeError {
    BridgeError::transport(
        TransportCause::Reset,
        format!("server closed the connection after the NTLM {} leg", leg),
    )
}

/// Negotiate (NTLMv2) authentication strategy.
///
/// Seals bodies on plain-HTTP channels by default, as a stock WinRM listener
/// refuses unencrypted traffic.
#[derive(Debug, Clone, Copy)]
pub struct NegotiateAuth {
    seal: bool,
}

impl NegotiateAuth {
    pub fn new() -> Self {
        Self { seal: true }
    }

    /// Never seal. Only for listeners configured with `AllowUnencrypted`.
    pub fn unsealed() -> Self {
        Self { seal: false }
    }

    /// Whether bodies sent on `channel` get sealed.
    pub fn seals_on(&self, channel: &dyn Channel) -> bool {
        self.seal && !channel.is_encrypted()
    }
}

impl Default for NegotiateAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for NegotiateAuth {
    async fn send(
        &self,
        channel: &dyn Channel,
        credential: &Credential,
        body: &str,
    ) -> Result<Reply, BridgeError> {
        let sealing = self.seals_on(channel);
        let negotiate = format!("Negotiate {}", BASE64.encode(negotiate_message()));
        let reply = channel
            .exchange(Exchange::authorized(&negotiate, None))
            .await?;

        if !reply.is_unauthorized() {
            return Err(protocol(format!(
                "expected an NTLM challenge, got HTTP {}",
                reply.status
            )));
        }
        // A bare 401 without a token means the scheme or account is refused
        let Some(token) = reply.challenge_token("Negotiate").filter(|t| !t.is_empty()) else {
            return Ok(reply);
        };
        if reply.closes_connection {
            return Err(leg_dropped("CHALLENGE"));
        }

        let raw = BASE64
            .decode(token)
            .map_err(|e| protocol(format!("undecodable NTLM challenge: {}", e)))?;
        let challenge = Challenge::parse(&raw)?;
        trace!(flags = format_args!("{:#010x}", challenge.flags), sealing, "NTLM challenge received");
        if sealing && !challenge.grants_sealing() {
            return Err(BridgeError::transport(
                TransportCause::Unencrypted,
                "server would not agree to NTLM sealing on a plain HTTP channel; use TLS",
            ));
        }

        let authentication =
            authenticate_message(credential, &challenge, rand::random(), rand::random())?;
        let header = Zeroizing::new(format!("Negotiate {}", BASE64.encode(&authentication.message)));
        if !sealing {
            return channel
                .exchange(Exchange::authorized(&header, Some(body)))
                .await;
        }

        let reply = channel.exchange(Exchange::authorized(&header, None)).await?;
        if !reply.is_success() {
            return Ok(reply);
        }
        if reply.closes_connection {
            return Err(leg_dropped("AUTHENTICATE"));
        }

        let mut context = SecurityContext::client(&authentication.session_key);
        let framed = context.wrap(body.as_bytes())?;
        let mut reply = channel.exchange(Exchange::sealed(&framed)).await?;
        if reply.is_unauthorized() {
            // The credentials were accepted one leg earlier on this channel
            return Err(BridgeError::transport(
                TransportCause::Reset,
                "sealed request was not recognized; the authenticated connection was not kept",
            ));
        }
        let Some(sealed) = reply.sealed.take() else {
            return Ok(reply);
        };
        let plaintext = context.unwrap(&sealed)?;
        reply.body = String::from_utf8_lossy(&plaintext).into_owned();
        Ok(reply)
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Negotiate
    }
}

/// Build a CHALLENGE message. Server side, used by the scripted endpoint.
#[cfg(test)]
pub(crate) fn challenge_message(server_challenge: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    challenge_message_with_flags(server_challenge, target_info, CLIENT_FLAGS)
}

/// CHALLENGE message granting only `flags`.
#[cfg(test)]
pub(crate) fn challenge_message_with_flags(
    server_challenge: &[u8; 8],
    target_info: &[u8],
    flags: u32,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(48 + target_info.len());
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&2u32.to_le_bytes());
    push_security_buffer(&mut message, 0, 48);
    message.extend_from_slice(&flags.to_le_bytes());
    message.extend_from_slice(server_challenge);
    message.extend_from_slice(&[0u8; 8]);
    push_security_buffer(&mut message, target_info.len() as u16, 48);
    message.extend_from_slice(target_info);
    message
}

/// Flags of a server that authenticates but will not seal.
#[cfg(test)]
pub(crate) const FLAGS_WITHOUT_SEALING: u32 = CLIENT_FLAGS & !SEALING_FLAGS;

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn sample_target_info() -> Vec<u8> {
        let mut info = vec![0x02, 0x00, 0x0c, 0x00];
        info.extend(utf16le("Domain"));
        info.extend([0x01, 0x00, 0x0c, 0x00]);
        info.extend(utf16le("Server"));
        info.extend([0x00, 0x00, 0x00, 0x00]);
        info
    }

    mod hashing {
        use super::*;

        #[test]
        fn test_nt_owf_v2_reference_vector() {
            let key = nt_owf_v2("Password", "User", "Domain").unwrap();
            assert_eq!(key.to_vec(), hex("0c868a403bfd7a93a3001ef22ef02e3f"));
        }

        #[test]
        fn test_nt_proof_reference_vector() {
            let key = nt_owf_v2("Password", "User", "Domain").unwrap();
            let server: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
            let response =
                ntlmv2_response(&key, &server, &[0xaa; 8], 0, &sample_target_info()).unwrap();
            assert_eq!(response[..16].to_vec(), hex("68cd0ab851e51c96aabc927bebef6a1c"));
            assert_eq!(&response[16..20], &[0x01u8, 0x01, 0x00, 0x00]);
        }

        #[test]
        fn test_session_key_reference_vectors() {
            let key = nt_owf_v2("Password", "User", "Domain").unwrap();
            let server: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
            let response =
                ntlmv2_response(&key, &server, &[0xaa; 8], 0, &sample_target_info()).unwrap();
            let session_base_key = hmac_md5(&key, &response[..16]).unwrap();
            assert_eq!(session_base_key.to_vec(), hex("8de40ccadbc14a82f15cb0ad0de95ca3"));

            let mut encrypted = [0x55u8; 16];
            Rc4::new(&session_base_key).apply(&mut encrypted);
            assert_eq!(encrypted.to_vec(), hex("c5dad2544fc9799094ce1ce90bc9d03e"));
        }

        #[test]
        fn test_split_principal() {
            assert_eq!(split_principal("CORP\\admin"), ("CORP", "admin"));
            assert_eq!(split_principal("admin@corp.local"), ("", "admin@corp.local"));
            assert_eq!(split_principal("Administrator"), ("", "Administrator"));
        }
    }

    mod messages {
        use super::*;

        #[test]
        fn test_negotiate_message_layout() {
            let msg = negotiate_message();
            assert_eq!(msg.len(), 32);
            assert_eq!(&msg[..8], SIGNATURE);
            assert_eq!(read_u32(&msg, 8), Some(1));
            assert_eq!(read_u32(&msg, 12), Some(CLIENT_FLAGS));
        }

        #[test]
        fn test_challenge_parse() {
            let info = sample_target_info();
            let raw = challenge_message(&[7u8; 8], &info);
            let challenge = Challenge::parse(&raw).unwrap();
            assert_eq!(challenge.server_challenge, [7u8; 8]);
            assert_eq!(challenge.target_info, info);
            assert_eq!(challenge.timestamp(), None);
        }

        #[test]
        fn test_challenge_timestamp_av_pair() {
            let mut info = vec![0x07, 0x00, 0x08, 0x00];
            info.extend(42u64.to_le_bytes());
            info.extend([0x00, 0x00, 0x00, 0x00]);
            let challenge = Challenge::parse(&challenge_message(&[0u8; 8], &info)).unwrap();
            assert_eq!(challenge.timestamp(), Some(42));
        }

        #[test]
        fn test_challenge_rejects_garbage() {
            assert!(Challenge::parse(b"short").is_err());
            let mut raw = challenge_message(&[0u8; 8], &[]);
            raw[8] = 3;
            assert!(Challenge::parse(&raw).is_err());
        }

        #[test]
        fn test_challenge_rejects_out_of_bounds_target_info() {
            let mut raw = challenge_message(&[0u8; 8], &[1, 2, 3, 4]);
            raw[40] = 0xff;
            let err = Challenge::parse(&raw).unwrap_err();
            assert_eq!(err.cause(), Some(TransportCause::Protocol));
        }

        #[test]
        fn test_authenticate_verifies_with_right_password() {
            let cred = Credential::new("CORP\\svc-admin", "s3cret!").unwrap();
            let server = [9u8; 8];
            let challenge = Challenge::parse(&challenge_message(&server, &sample_target_info()))
                .unwrap();
            let auth = authenticate_message(&cred, &challenge, [1u8; 8], [2u8; 16]).unwrap();
            let msg = &auth.message;

            assert_eq!(read_u32(msg, 8), Some(3));
            assert!(accept_authenticate(msg, &server, "s3cret!").is_some());
            assert!(accept_authenticate(msg, &server, "wrong").is_none());
            assert!(accept_authenticate(msg, &[0u8; 8], "s3cret!").is_none());
        }

        #[test]
        fn test_key_exchange_shares_session_key() {
            let cred = Credential::new("CORP\\svc-admin", "s3cret!").unwrap();
            let server = [9u8; 8];
            let challenge = Challenge::parse(&challenge_message(&server, &sample_target_info()))
                .unwrap();
            assert!(challenge.grants_sealing());
            let auth = authenticate_message(&cred, &challenge, [1u8; 8], [0x42; 16]).unwrap();

            assert_eq!(*auth.session_key, [0x42; 16]);
            assert_eq!(security_buffer(&auth.message, 52).map(<[u8]>::len), Some(16));
            let recovered = accept_authenticate(&auth.message, &server, "s3cret!").unwrap();
            assert_eq!(*recovered, [0x42; 16]);
        }

        #[test]
        fn test_without_key_exchange_uses_base_key() {
            let cred = Credential::new("admin", "pw").unwrap();
            let server = [4u8; 8];
            let raw = challenge_message_with_flags(&server, &[], FLAGS_WITHOUT_SEALING);
            let challenge = Challenge::parse(&raw).unwrap();
            assert!(!challenge.grants_sealing());

            let auth = authenticate_message(&cred, &challenge, [1u8; 8], [0x42; 16]).unwrap();
            assert_ne!(*auth.session_key, [0x42; 16]);
            assert_eq!(security_buffer(&auth.message, 52).map(<[u8]>::len), Some(0));
            let recovered = accept_authenticate(&auth.message, &server, "pw").unwrap();
            assert_eq!(*recovered, *auth.session_key);
        }

        #[test]
        fn test_oversized_target_info_rejected() {
            let cred = Credential::new("CORP\\svc-admin", "s3cret!").unwrap();
            let challenge = Challenge {
                flags: CLIENT_FLAGS,
                server_challenge: [9u8; 8],
                target_info: vec![0u8; 65_500],
            };
            let err = authenticate_message(&cred, &challenge, [1u8; 8], [2u8; 16])
                .err()
                .unwrap();
            assert_eq!(err.cause(), Some(TransportCause::Protocol));
            assert!(err.to_string().contains("NT response"));
        }
    }
}
