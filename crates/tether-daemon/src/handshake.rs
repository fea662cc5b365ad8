//! Pairing handshake
//!
//! The relay is an untrusted store-and-forward pipe, so trust is established
//! end to end: both sides derive the same ECDH secret (P-256) from their own
//! private key and the other side's public key, then one side proves it holds
//! the secret by returning `HMAC-SHA256(secret, challenge)`.
//!
//! Message flow with the daemon as responder:
//!
//! ```text
//! relay  -> daemon  relay:paired { peerId, peerPublicKey }
//! daemon -> phone   handshake:initiate { peerId, peerPublicKey: <ours>, challenge }
//! phone  -> daemon  handshake:response { peerId, signature }
//! daemon -> phone   handshake:confirmed
//! ```
//!
//! When the relay does not hand over the peer key, the daemon waits for the
//! peer's `handshake:initiate` and plays the initiator instead.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use tether_core::error::HandshakeError;
use tether_protocol::HandshakeMessage;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a challenge
pub const CHALLENGE_BYTES: usize = 32;

/// Local P-256 key pair, generated once per daemon run
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Public key as base64 of the uncompressed SEC1 point
    pub fn public_key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.public.to_encoded_point(false).as_bytes())
    }

    fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// 32-byte ECDH shared secret (raw x-coordinate)
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Decode a peer public key sent as base64 (or hex) SEC1 bytes
pub fn parse_public_key(encoded: &str) -> Result<PublicKey, HandshakeError> {
    let encoded = encoded.trim();
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .or_else(|_| hex::decode(encoded))
        .map_err(|_| HandshakeError::InvalidPublicKey("not base64 or hex".to_string()))?;
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|_| HandshakeError::InvalidPublicKey("not a P-256 point".to_string()))
}

/// ECDH between our private key and the peer's public key
pub fn derive_shared_secret(
    key_pair: &KeyPair,
    peer_public_key: &str,
) -> Result<SharedSecret, HandshakeError> {
    let peer = parse_public_key(peer_public_key)?;
    let shared = diffie_hellman(key_pair.secret().to_nonzero_scalar(), peer.as_affine());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(shared.raw_secret_bytes().as_slice());
    Ok(SharedSecret(bytes))
}

/// Hex-encoded HMAC-SHA256 of `challenge` under `secret`
pub fn sign(challenge: &str, secret: &SharedSecret) -> Result<String, HandshakeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| HandshakeError::Crypto(e.to_string()))?;
    mac.update(challenge.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a signature in constant time
pub fn verify(challenge: &str, signature: &str, secret: &SharedSecret) -> bool {
    let Ok(expected) = sign(challenge, secret) else {
        return false;
    };
    constant_time_eq(
        expected.as_bytes(),
        signature.trim().to_ascii_lowercase().as_bytes(),
    )
}

/// Compare every byte position regardless of where the first difference is
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = a.len() ^ b.len();
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

/// Random hex challenge
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Progress of one pairing's handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Not paired
    Idle,
    /// Paired without a peer key; waiting for the peer's initiate
    AwaitingInitiate { peer_id: String },
    /// We sent a challenge and wait for its signature
    AwaitingResponse { peer_id: String, challenge: String },
    /// We signed the peer's challenge and wait for confirmation
    AwaitingConfirmation { peer_id: String },
    /// Peer is trusted
    Confirmed { peer_id: String },
    /// Pairing aborted; needs a new `relay:paired`
    Failed,
}

/// What the caller should do after a handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send this message and keep waiting
    Reply(HandshakeMessage),
    /// Peer is now trusted; send `reply` if present
    Confirmed {
        peer_id: String,
        secret: SharedSecret,
        reply: Option<HandshakeMessage>,
    },
    /// Nothing to do
    Ignored,
}

/// Handshake state machine for a single pairing
#[derive(Debug)]
pub struct Handshake {
    key_pair: Option<Arc<KeyPair>>,
    state: HandshakeState,
    secret: Option<SharedSecret>,
}

impl Handshake {
    pub fn new(key_pair: Option<Arc<KeyPair>>) -> Self {
        Self {
            key_pair,
            state: HandshakeState::Idle,
            secret: None,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Whether the peer has been verified
    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, HandshakeState::Confirmed { .. })
    }

    /// Peer id of the current pairing, if any
    pub fn peer_id(&self) -> Option<&str> {
        match &self.state {
            HandshakeState::AwaitingInitiate { peer_id }
            | HandshakeState::AwaitingResponse { peer_id, .. }
            | HandshakeState::AwaitingConfirmation { peer_id }
            | HandshakeState::Confirmed { peer_id } => Some(peer_id),
            HandshakeState::Idle | HandshakeState::Failed => None,
        }
    }

    /// Forget the pairing and its secret
    pub fn reset(&mut self) {
        self.state = HandshakeState::Idle;
        self.secret = None;
    }

    fn key_pair(&self) -> Result<&KeyPair, HandshakeError> {
        self.key_pair
            .as_deref()
            .ok_or(HandshakeError::MissingKeyPair)
    }

    fn fail(&mut self, error: HandshakeError) -> HandshakeError {
        self.state = HandshakeState::Failed;
        self.secret = None;
        error
    }

    /// The relay introduced a peer.
    ///
    /// With the peer's key we take the responder role and return the
    /// `handshake:initiate` to send; without it we wait for the peer.
    pub fn on_paired(
        &mut self,
        peer_id: &str,
        peer_public_key: Option<&str>,
    ) -> Result<Option<HandshakeMessage>, HandshakeError> {
        self.reset();

        let Some(peer_key) = peer_public_key else {
            self.state = HandshakeState::AwaitingInitiate {
                peer_id: peer_id.to_string(),
            };
            return Ok(None);
        };

        let derived = self.key_pair().and_then(|key_pair| {
            Ok((
                derive_shared_secret(key_pair, peer_key)?,
                key_pair.public_key_base64(),
            ))
        });
        let (secret, our_key) = derived.map_err(|e| self.fail(e))?;

        let challenge = generate_challenge();
        self.secret = Some(secret);
        self.state = HandshakeState::AwaitingResponse {
            peer_id: peer_id.to_string(),
            challenge: challenge.clone(),
        };

        Ok(Some(HandshakeMessage::Initiate {
            peer_id: peer_id.to_string(),
            peer_public_key: our_key,
            challenge,
        }))
    }

    /// Process one inbound handshake message
    pub fn on_message(&mut self, message: HandshakeMessage) -> Result<HandshakeStep, HandshakeError> {
        if let HandshakeState::Confirmed { peer_id } = &self.state {
            let paired = peer_id.clone();
            return self.on_message_confirmed(paired, message);
        }

        match message {
            HandshakeMessage::Initiate {
                peer_id,
                peer_public_key,
                challenge,
            } => self.on_initiate(peer_id, &peer_public_key, &challenge),

            HandshakeMessage::Response { peer_id, signature }
            | HandshakeMessage::Verify { peer_id, signature } => {
                self.on_signature(peer_id, &signature)
            }

            HandshakeMessage::Confirmed { peer_id } => self.on_confirmed(peer_id.as_deref()),

            HandshakeMessage::Error { peer_id, error } => {
                self.check_peer(peer_id.as_deref())?;
                Err(self.fail(HandshakeError::Rejected(error)))
            }
        }
    }

    /// A verified pairing ends only on its own peer's error or a new `relay:paired`
    fn on_message_confirmed(
        &mut self,
        paired: String,
        message: HandshakeMessage,
    ) -> Result<HandshakeStep, HandshakeError> {
        match message {
            HandshakeMessage::Error {
                peer_id: Some(peer_id),
                error,
            } if peer_id == paired => Err(self.fail(HandshakeError::Rejected(error))),
            other => {
                tracing::warn!(
                    peer = %paired,
                    from = ?other.peer_id(),
                    "Ignoring handshake message; pairing already confirmed"
                );
                Ok(HandshakeStep::Ignored)
            }
        }
    }

    /// Messages naming another peer are rejected without touching the pairing
    fn check_peer(&self, claimed: Option<&str>) -> Result<(), HandshakeError> {
        match (self.peer_id(), claimed) {
            (Some(expected), Some(got)) if expected != got => Err(HandshakeError::PeerMismatch {
                expected: expected.to_string(),
                got: got.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn on_initiate(
        &mut self,
        peer_id: String,
        peer_public_key: &str,
        challenge: &str,
    ) -> Result<HandshakeStep, HandshakeError> {
        self.check_peer(Some(&peer_id))?;
        match self.state {
            HandshakeState::Idle | HandshakeState::AwaitingInitiate { .. } => {}
            _ => return Err(self.unexpected("initiate")),
        }

        let derived = self
            .key_pair()
            .and_then(|key_pair| derive_shared_secret(key_pair, peer_public_key));
        let secret = derived.map_err(|e| self.fail(e))?;
        let signature = sign(challenge, &secret).map_err(|e| self.fail(e))?;

        self.secret = Some(secret);
        self.state = HandshakeState::AwaitingConfirmation {
            peer_id: peer_id.clone(),
        };
        Ok(HandshakeStep::Reply(HandshakeMessage::Response {
            peer_id,
            signature,
        }))
    }

    fn on_signature(&mut self, peer_id: String, signature: &str) -> Result<HandshakeStep, HandshakeError> {
        self.check_peer(Some(&peer_id))?;
        let challenge = match &self.state {
            HandshakeState::AwaitingResponse { challenge, .. } => challenge.clone(),
            _ => return Err(self.unexpected("signature")),
        };
        let Some(secret) = self.secret.clone() else {
            return Err(self.fail(HandshakeError::NotPaired));
        };

        if !verify(&challenge, signature, &secret) {
            return Err(self.fail(HandshakeError::SignatureMismatch));
        }

        self.state = HandshakeState::Confirmed {
            peer_id: peer_id.clone(),
        };
        Ok(HandshakeStep::Confirmed {
            peer_id: peer_id.clone(),
            secret,
            reply: Some(HandshakeMessage::Confirmed {
                peer_id: Some(peer_id),
            }),
        })
    }

    fn on_confirmed(&mut self, claimed: Option<&str>) -> Result<HandshakeStep, HandshakeError> {
        self.check_peer(claimed)?;
        let HandshakeState::AwaitingConfirmation { peer_id } = &self.state else {
            return Err(self.unexpected("confirmed"));
        };
        let peer_id = peer_id.clone();
        let Some(secret) = self.secret.clone() else {
            return Err(self.fail(HandshakeError::NotPaired));
        };
        self.state = HandshakeState::Confirmed {
            peer_id: peer_id.clone(),
        };
        Ok(HandshakeStep::Confirmed {
            peer_id,
            secret,
            reply: None,
        })
    }

    fn unexpected(&mut self, what: &str) -> HandshakeError {
        let error = match self.state {
            HandshakeState::Idle | HandshakeState::Failed => HandshakeError::NotPaired,
            _ => HandshakeError::UnexpectedMessage(format!("{} in state {:?}", what, self.state)),
        };
        self.fail(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Arc<KeyPair>, Arc<KeyPair>) {
        (Arc::new(KeyPair::generate()), Arc::new(KeyPair::generate()))
    }

    #[test]
    fn test_both_sides_derive_same_secret() {
        let (a, b) = pair();
        let ab = derive_shared_secret(&a, &b.public_key_base64()).unwrap();
        let ba = derive_shared_secret(&b, &a.public_key_base64()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_public_key_is_uncompressed_sec1() {
        let key = KeyPair::generate();
        let bytes = BASE64_STANDARD.decode(key.public_key_base64()).unwrap();
        assert_eq!(bytes.len(), 65);
        assert_eq!(bytes[0], 0x04);
    }

    #[test]
    fn test_sign_then_verify() {
        let secret = SharedSecret::from_bytes([7u8; 32]);
        for _ in 0..8 {
            let challenge = generate_challenge();
            let signature = sign(&challenge, &secret).unwrap();
            assert_eq!(signature.len(), 64);
            assert!(verify(&challenge, &signature, &secret));
            assert!(verify(&challenge, &signature.to_uppercase(), &secret));
        }
    }

    #[test]
    fn test_any_single_bit_flip_fails() {
        let secret = SharedSecret::from_bytes([42u8; 32]);
        let challenge = "deadbeef";
        let signature = sign(challenge, &secret).unwrap();
        let raw = hex::decode(&signature).unwrap();

        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut mutated = raw.clone();
                mutated[byte] ^= 1 << bit;
                assert!(!verify(challenge, &hex::encode(&mutated), &secret));
            }
        }
    }

    #[test]
    fn test_verify_rejects_wrong_secret_and_length() {
        let secret = SharedSecret::from_bytes([1u8; 32]);
        let other = SharedSecret::from_bytes([2u8; 32]);
        let signature = sign("abc", &secret).unwrap();
        assert!(!verify("abc", &signature, &other));
        assert!(!verify("abc", &signature[..63], &secret));
        assert!(!verify("abc", "", &secret));
    }

    #[test]
    fn test_invalid_public_key() {
        let key = KeyPair::generate();
        assert!(matches!(
            derive_shared_secret(&key, "bm90IGEga2V5"),
            Err(HandshakeError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_full_handshake_daemon_as_responder() {
        let (desk_key, phone_key) = pair();
        let mut desk = Handshake::new(Some(Arc::clone(&desk_key)));
        let mut phone = Handshake::new(Some(Arc::clone(&phone_key)));

        let initiate = desk
            .on_paired("phone", Some(&phone_key.public_key_base64()))
            .unwrap()
            .unwrap();

        let response = match phone.on_message(initiate).unwrap() {
            HandshakeStep::Reply(msg) => msg,
            other => panic!("unexpected step: {:?}", other),
        };

        let (desk_secret, confirmed) = match desk.on_message(response).unwrap() {
            HandshakeStep::Confirmed { secret, reply, .. } => (secret, reply.unwrap()),
            other => panic!("unexpected step: {:?}", other),
        };
        assert!(desk.is_confirmed());

        match phone.on_message(confirmed).unwrap() {
            HandshakeStep::Confirmed { secret, reply, .. } => {
                assert_eq!(secret, desk_secret);
                assert!(reply.is_none());
            }
            other => panic!("unexpected step: {:?}", other),
        }
        assert!(phone.is_confirmed());
    }

    #[test]
    fn test_tampered_response_fails() {
        let (desk_key, phone_key) = pair();
        let mut desk = Handshake::new(Some(desk_key));
        desk.on_paired("phone", Some(&phone_key.public_key_base64()))
            .unwrap();

        let err = desk
            .on_message(HandshakeMessage::Response {
                peer_id: "phone".to_string(),
                signature: "00".repeat(32),
            })
            .unwrap_err();
        assert_eq!(err, HandshakeError::SignatureMismatch);
        assert_eq!(desk.state(), &HandshakeState::Failed);
        assert!(!desk.is_confirmed());
    }

    #[test]
    fn test_missing_key_pair() {
        let mut desk = Handshake::new(None);
        let err = desk.on_paired("phone", Some("AAAA")).unwrap_err();
        assert_eq!(err, HandshakeError::MissingKeyPair);
    }

    #[test]
    fn test_response_before_pairing() {
        let mut desk = Handshake::new(Some(Arc::new(KeyPair::generate())));
        let err = desk
            .on_message(HandshakeMessage::Verify {
                peer_id: "phone".to_string(),
                signature: "ab".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, HandshakeError::NotPaired);
    }

    #[test]
    fn test_paired_without_key_waits_for_initiate() {
        let mut desk = Handshake::new(Some(Arc::new(KeyPair::generate())));
        assert!(desk.on_paired("phone", None).unwrap().is_none());
        assert_eq!(desk.peer_id(), Some("phone"));
        assert!(matches!(desk.state(), HandshakeState::AwaitingInitiate { .. }));
    }

    #[test]
    fn test_initiate_from_unpaired_peer_rejected() {
        let (desk_key, phone_key) = pair();
        let mut desk = Handshake::new(Some(desk_key));
        desk.on_paired("phone", None).unwrap();

        let err = desk
            .on_message(HandshakeMessage::Initiate {
                peer_id: "intruder".to_string(),
                peer_public_key: phone_key.public_key_base64(),
                challenge: generate_challenge(),
            })
            .unwrap_err();
        assert!(matches!(err, HandshakeError::PeerMismatch { .. }));
        assert_eq!(
            desk.state(),
            &HandshakeState::AwaitingInitiate {
                peer_id: "phone".to_string()
            }
        );
    }

    #[test]
    fn test_confirmed_pairing_ignores_new_initiate() {
        let (desk_key, phone_key) = pair();
        let mut desk = Handshake::new(Some(desk_key));
        let mut phone = Handshake::new(Some(Arc::clone(&phone_key)));
        let initiate = desk
            .on_paired("phone", Some(&phone_key.public_key_base64()))
            .unwrap()
            .unwrap();
        let HandshakeStep::Reply(response) = phone.on_message(initiate).unwrap() else {
            panic!("phone did not answer the challenge");
        };
        desk.on_message(response).unwrap();
        assert!(desk.is_confirmed());

        let stray = KeyPair::generate();
        for message in [
            HandshakeMessage::Initiate {
                peer_id: "phone".to_string(),
                peer_public_key: stray.public_key_base64(),
                challenge: generate_challenge(),
            },
            HandshakeMessage::Confirmed { peer_id: None },
            HandshakeMessage::Error {
                peer_id: Some("intruder".to_string()),
                error: "bye".to_string(),
            },
        ] {
            assert_eq!(desk.on_message(message).unwrap(), HandshakeStep::Ignored);
        }
        assert_eq!(
            desk.state(),
            &HandshakeState::Confirmed {
                peer_id: "phone".to_string()
            }
        );

        let err = desk
            .on_message(HandshakeMessage::Error {
                peer_id: Some("phone".to_string()),
                error: "bye".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, HandshakeError::Rejected("bye".to_string()));
        assert!(!desk.is_confirmed());
    }
}
