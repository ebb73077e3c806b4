//! Per-session cryptographic state machine.
//!
//! # Protocol
//!
//! ## Handshake (X3DH-style, symmetric)
//! Each party holds an identity pair and an ephemeral pair (both X25519).
//! After exchanging public bundles, both compute four DH agreements:
//!
//!   DH1 = DH(identity,  partner identity)
//!   DH2 = DH(identity,  partner ephemeral)
//!   DH3 = DH(ephemeral, partner identity)
//!   DH4 = DH(ephemeral, partner ephemeral)
//!
//! DH2 and DH3 swap operands between the two roles, so the four secrets
//! are byte-sorted before concatenation — both parties then feed an
//! identical buffer into HKDF and derive the same root key.
//!
//! ## Chains
//! The root key deterministically yields chains A and B. The initiator
//! sends on A and receives on B; the responder mirrors. Each message key
//! is derived-then-advanced: the chain key is overwritten by its own next
//! step before the message key is used, so captured state never reveals
//! past messages.
//!
//! ## Rotation
//! On demand, a fresh ratchet pair is generated and DH'd against the
//! partner's last known ratchet key; the output is mixed into the root,
//! both chains are re-derived and both counters reset. The peer applies
//! the mirrored step when the new ratchet public key reaches it.

use x25519_dalek::PublicKey as X25519Public;
use zeroize::Zeroize;

use crate::{
    aead,
    error::CryptoError,
    kdf,
    keys::{decode_key, encode_key, KeyPair, PublicKeyBundle},
};

/// Bound on receiving-chain fast-forward for out-of-order arrivals.
/// Limits work and memory on hostile counter jumps.
pub const MAX_FORWARD_SKIP: u64 = 256;

const MESSAGE_AAD_TAG: &[u8; 9] = b"mw-msg-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Ciphertext plus the material the peer needs to derive the message key.
/// Counters are 1-based: the first message of a chain carries counter 1.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; aead::NONCE_LEN],
    pub counter: u64,
}

fn message_aad(counter: u64) -> [u8; 17] {
    let mut aad = [0u8; 17];
    aad[..9].copy_from_slice(MESSAGE_AAD_TAG);
    aad[9..].copy_from_slice(&counter.to_be_bytes());
    aad
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Crypto state for exactly one session. Owned by one session record,
/// never shared. All key material is wiped on `clear()` and on drop.
pub struct SessionCrypto {
    identity: Option<KeyPair>,
    ephemeral: Option<KeyPair>,
    ratchet: Option<KeyPair>,
    partner_ratchet: Option<X25519Public>,
    role: Option<Role>,
    root_key: Option<[u8; 32]>,
    send_chain: Option<[u8; 32]>,
    recv_chain: Option<[u8; 32]>,
    send_counter: u64,
    /// Counter of the last message processed from the partner.
    partner_counter: u64,
}

impl SessionCrypto {
    /// Generate the two independent handshake key pairs. Must precede all
    /// other operations.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            identity: Some(KeyPair::generate()?),
            ephemeral: Some(KeyPair::generate()?),
            ratchet: None,
            partner_ratchet: None,
            role: None,
            root_key: None,
            send_chain: None,
            recv_chain: None,
            send_counter: 0,
            partner_counter: 0,
        })
    }

    /// Export identity + ephemeral public keys for the handshake.
    pub fn public_keys(&self) -> Result<PublicKeyBundle, CryptoError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or(CryptoError::NotInitialised("identity key"))?;
        let ephemeral = self
            .ephemeral
            .as_ref()
            .ok_or(CryptoError::NotInitialised("ephemeral key"))?;
        Ok(PublicKeyBundle {
            identity: identity.public_b64(),
            ephemeral: ephemeral.public_b64(),
        })
    }

    /// Run the 4-way DH key agreement against the partner's bundle,
    /// derive the root key and both message chains, and generate this
    /// side's first ratchet key pair.
    pub fn perform_handshake(
        &mut self,
        partner: &PublicKeyBundle,
        role: Role,
    ) -> Result<(), CryptoError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or(CryptoError::NotInitialised("identity key"))?;
        let ephemeral = self
            .ephemeral
            .as_ref()
            .ok_or(CryptoError::NotInitialised("ephemeral key"))?;

        let partner_identity = partner.identity_key()?;
        let partner_ephemeral = partner.ephemeral_key()?;

        // Byte-sorting makes the concatenation order role-independent:
        // the cross agreements (identity × ephemeral) swap operands
        // between initiator and responder.
        let mut secrets = [
            identity.diffie_hellman(&partner_identity),
            identity.diffie_hellman(&partner_ephemeral),
            ephemeral.diffie_hellman(&partner_identity),
            ephemeral.diffie_hellman(&partner_ephemeral),
        ];
        secrets.sort_unstable();

        let mut combined = Vec::with_capacity(128);
        for secret in &secrets {
            combined.extend_from_slice(secret);
        }
        let root = kdf::derive_root_key(&combined);
        combined.zeroize();
        for secret in secrets.iter_mut() {
            secret.zeroize();
        }
        let root = root?;

        let (chain_a, chain_b) = kdf::derive_chain_keys(&root)?;
        self.install_chains(role, root, chain_a, chain_b);
        self.ratchet = Some(KeyPair::generate()?);
        self.role = Some(role);
        Ok(())
    }

    /// Current ratchet public key, exchanged post-handshake and re-sent
    /// after every rotation.
    pub fn ratchet_public_key(&self) -> Result<String, CryptoError> {
        let ratchet = self
            .ratchet
            .as_ref()
            .ok_or(CryptoError::NotInitialised("ratchet key"))?;
        Ok(encode_key(ratchet.public()))
    }

    /// Install the partner's ratchet public key, replacing any previous
    /// one. Callers must not feed replayed handshake keys here after a
    /// rotation has moved the partner key on.
    pub fn install_partner_ratchet(&mut self, key_b64: &str) -> Result<(), CryptoError> {
        self.partner_ratchet = Some(decode_key(key_b64)?);
        Ok(())
    }

    /// Both ratchet keys present — the precondition for READY.
    pub fn ratchet_complete(&self) -> bool {
        self.ratchet.is_some() && self.partner_ratchet.is_some()
    }

    /// Root key derived — the handshake DH phase has run on this side.
    pub fn has_root_key(&self) -> bool {
        self.root_key.is_some()
    }

    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    pub fn partner_counter(&self) -> u64 {
        self.partner_counter
    }

    // ── Encrypt / decrypt ────────────────────────────────────────────────

    /// Encrypt one message under a one-time key from the sending chain.
    ///
    /// Derive-then-advance: the chain key is replaced before the message
    /// key is used, so no chain key is ever reused across messages.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SealedMessage, CryptoError> {
        let chain = self
            .send_chain
            .as_mut()
            .ok_or(CryptoError::NotInitialised("sending chain"))?;

        let (next_ck, mut mk) = kdf::chain_step(chain)?;
        *chain = next_ck;
        self.send_counter += 1;
        let counter = self.send_counter;

        let result = aead::encrypt(&mk, plaintext, &message_aad(counter));
        mk.zeroize();
        let (nonce, ciphertext) = result?;

        Ok(SealedMessage {
            ciphertext,
            nonce,
            counter,
        })
    }

    /// Decrypt one message from the receiving chain.
    ///
    /// A counter ahead of the expected one fast-forwards the chain,
    /// computing and discarding the intermediate keys (bounded by
    /// `MAX_FORWARD_SKIP`). A counter at or below the last processed one
    /// fails: the chain has already advanced past that key and skipped
    /// keys are not cached. Every failure is the uniform `DecryptFailed`.
    ///
    /// The chain state is committed only after the AEAD tag verifies; all
    /// candidate keys are derived on a copy, so a forged or stale message
    /// cannot desynchronise the chain.
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        nonce: &[u8],
        counter: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let chain = match self.recv_chain {
            Some(chain) => chain,
            None => return Err(CryptoError::DecryptFailed),
        };

        if counter <= self.partner_counter {
            return Err(CryptoError::DecryptFailed);
        }
        let skip = counter - self.partner_counter - 1;
        if skip > MAX_FORWARD_SKIP {
            return Err(CryptoError::DecryptFailed);
        }

        let mut ck = chain;
        for _ in 0..skip {
            match kdf::chain_step(&ck) {
                Ok((next_ck, mut discarded)) => {
                    ck = next_ck;
                    discarded.zeroize();
                }
                Err(_) => {
                    ck.zeroize();
                    return Err(CryptoError::DecryptFailed);
                }
            }
        }
        let (mut next_ck, mut mk) = match kdf::chain_step(&ck) {
            Ok(pair) => pair,
            Err(_) => {
                ck.zeroize();
                return Err(CryptoError::DecryptFailed);
            }
        };
        ck.zeroize();

        let result = aead::decrypt(&mk, nonce, ciphertext, &message_aad(counter));
        mk.zeroize();
        match result {
            Ok(plaintext) => {
                self.recv_chain = Some(next_ck);
                self.partner_counter = counter;
                Ok(plaintext.to_vec())
            }
            Err(_) => {
                next_ck.zeroize();
                Err(CryptoError::DecryptFailed)
            }
        }
    }

    // ── Rotation ─────────────────────────────────────────────────────────

    /// Re-key this side: fresh ratchet pair, DH against the partner's last
    /// known ratchet key mixed into the root, chains re-derived, both
    /// counters reset. Valid only once a root key and a partner ratchet
    /// key exist.
    pub fn rotate(&mut self) -> Result<(), CryptoError> {
        let role = self.role.ok_or(CryptoError::NotInitialised("handshake"))?;
        let root = self
            .root_key
            .ok_or(CryptoError::NotInitialised("root key"))?;
        let partner = self
            .partner_ratchet
            .ok_or(CryptoError::NotInitialised("partner ratchet key"))?;

        let fresh = KeyPair::generate()?;
        let mut dh = fresh.diffie_hellman(&partner);
        let mixed = kdf::mix_root_key(&root, &dh);
        dh.zeroize();
        let (new_root, chain_a, chain_b) = mixed?;

        self.ratchet = Some(fresh);
        self.install_chains(role, new_root, chain_a, chain_b);
        Ok(())
    }

    /// Mirror of `rotate` on the receiving side: the partner announced a
    /// new ratchet public key; DH it against our unchanged ratchet secret
    /// and re-derive everything.
    pub fn apply_partner_rotation(&mut self, key_b64: &str) -> Result<(), CryptoError> {
        let role = self.role.ok_or(CryptoError::NotInitialised("handshake"))?;
        let root = self
            .root_key
            .ok_or(CryptoError::NotInitialised("root key"))?;
        let ratchet = self
            .ratchet
            .as_ref()
            .ok_or(CryptoError::NotInitialised("ratchet key"))?;

        let new_partner = decode_key(key_b64)?;
        let mut dh = ratchet.diffie_hellman(&new_partner);
        let mixed = kdf::mix_root_key(&root, &dh);
        dh.zeroize();
        let (new_root, chain_a, chain_b) = mixed?;

        self.partner_ratchet = Some(new_partner);
        self.install_chains(role, new_root, chain_a, chain_b);
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Discard all key material. Safe to call more than once.
    pub fn clear(&mut self) {
        self.identity = None;
        self.ephemeral = None;
        self.ratchet = None;
        self.partner_ratchet = None;
        self.role = None;
        self.wipe_chain_material();
        self.send_counter = 0;
        self.partner_counter = 0;
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn install_chains(
        &mut self,
        role: Role,
        root: [u8; 32],
        chain_a: [u8; 32],
        chain_b: [u8; 32],
    ) {
        self.wipe_chain_material();
        self.root_key = Some(root);
        match role {
            Role::Initiator => {
                self.send_chain = Some(chain_a);
                self.recv_chain = Some(chain_b);
            }
            Role::Responder => {
                self.send_chain = Some(chain_b);
                self.recv_chain = Some(chain_a);
            }
        }
        self.send_counter = 0;
        self.partner_counter = 0;
    }

    fn wipe_chain_material(&mut self) {
        if let Some(mut key) = self.root_key.take() {
            key.zeroize();
        }
        if let Some(mut key) = self.send_chain.take() {
            key.zeroize();
        }
        if let Some(mut key) = self.recv_chain.take() {
            key.zeroize();
        }
    }

    #[cfg(test)]
    fn chains(&self) -> (Option<[u8; 32]>, Option<[u8; 32]>) {
        (self.send_chain, self.recv_chain)
    }
}

impl Drop for SessionCrypto {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Both engines through the full handshake + ratchet exchange.
    fn handshaken_pair() -> (SessionCrypto, SessionCrypto) {
        let mut alice = SessionCrypto::generate().unwrap();
        let mut bob = SessionCrypto::generate().unwrap();

        let alice_bundle = alice.public_keys().unwrap();
        let bob_bundle = bob.public_keys().unwrap();

        bob.perform_handshake(&alice_bundle, Role::Responder).unwrap();
        alice.perform_handshake(&bob_bundle, Role::Initiator).unwrap();

        let alice_ratchet = alice.ratchet_public_key().unwrap();
        let bob_ratchet = bob.ratchet_public_key().unwrap();
        bob.install_partner_ratchet(&alice_ratchet).unwrap();
        alice.install_partner_ratchet(&bob_ratchet).unwrap();

        (alice, bob)
    }

    #[test]
    fn handshake_chains_are_mirrored() {
        let (alice, bob) = handshaken_pair();
        let (a_send, a_recv) = alice.chains();
        let (b_send, b_recv) = bob.chains();
        assert_eq!(a_send.unwrap(), b_recv.unwrap());
        assert_eq!(a_recv.unwrap(), b_send.unwrap());
        assert_ne!(a_send.unwrap(), a_recv.unwrap());
        assert!(alice.ratchet_complete());
        assert!(bob.ratchet_complete());
    }

    #[test]
    fn twenty_message_roundtrip_without_rehandshake() {
        let (mut alice, mut bob) = handshaken_pair();
        for i in 0..20u32 {
            let plaintext = format!("message {i}");
            let sealed = alice.encrypt(plaintext.as_bytes()).unwrap();
            assert_eq!(sealed.counter, u64::from(i) + 1);
            let opened = bob
                .decrypt(&sealed.ciphertext, &sealed.nonce, sealed.counter)
                .unwrap();
            assert_eq!(opened, plaintext.as_bytes());
        }
        // And the reverse direction shares nothing with the forward one.
        let sealed = bob.encrypt(b"reply").unwrap();
        assert_eq!(sealed.counter, 1);
        assert_eq!(
            alice
                .decrypt(&sealed.ciphertext, &sealed.nonce, sealed.counter)
                .unwrap(),
            b"reply"
        );
    }

    #[test]
    fn forward_skip_tolerates_reordered_head() {
        let (mut alice, mut bob) = handshaken_pair();
        // Burn counters 1..=4 so the interesting window is 5,6,7.
        for _ in 0..4 {
            let sealed = alice.encrypt(b"warmup").unwrap();
            bob.decrypt(&sealed.ciphertext, &sealed.nonce, sealed.counter)
                .unwrap();
        }
        let m5 = alice.encrypt(b"five").unwrap();
        let m6 = alice.encrypt(b"six").unwrap();
        let m7 = alice.encrypt(b"seven").unwrap();

        // 7 first: the receiving chain fast-forwards past 5 and 6.
        assert_eq!(
            bob.decrypt(&m7.ciphertext, &m7.nonce, m7.counter).unwrap(),
            b"seven"
        );
        // 6 and 5 arrive late: their keys were computed and discarded, so
        // both fail uniformly. Skipped keys are not cached.
        assert!(matches!(
            bob.decrypt(&m6.ciphertext, &m6.nonce, m6.counter),
            Err(CryptoError::DecryptFailed)
        ));
        assert!(matches!(
            bob.decrypt(&m5.ciphertext, &m5.nonce, m5.counter),
            Err(CryptoError::DecryptFailed)
        ));
        // The chain stays synchronised for the next in-order message.
        let m8 = alice.encrypt(b"eight").unwrap();
        assert_eq!(
            bob.decrypt(&m8.ciphertext, &m8.nonce, m8.counter).unwrap(),
            b"eight"
        );
    }

    #[test]
    fn failed_decrypt_leaves_chain_intact() {
        let (mut alice, mut bob) = handshaken_pair();
        let m1 = alice.encrypt(b"one").unwrap();
        let m2 = alice.encrypt(b"two").unwrap();

        // Forged ciphertext under the next expected counter.
        assert!(matches!(
            bob.decrypt(b"garbage", &m1.nonce, 1),
            Err(CryptoError::DecryptFailed)
        ));
        // And under a counter further ahead (would fast-forward).
        assert!(matches!(
            bob.decrypt(b"garbage", &m2.nonce, 4),
            Err(CryptoError::DecryptFailed)
        ));
        assert_eq!(bob.partner_counter(), 0);

        // Nothing was committed: the legitimate messages still decrypt.
        assert_eq!(
            bob.decrypt(&m1.ciphertext, &m1.nonce, m1.counter).unwrap(),
            b"one"
        );
        assert_eq!(
            bob.decrypt(&m2.ciphertext, &m2.nonce, m2.counter).unwrap(),
            b"two"
        );
    }

    #[test]
    fn forward_skip_is_bounded() {
        let (mut alice, mut bob) = handshaken_pair();
        let sealed = alice.encrypt(b"x").unwrap();
        assert!(bob
            .decrypt(&sealed.ciphertext, &sealed.nonce, MAX_FORWARD_SKIP + 2)
            .is_err());
    }

    #[test]
    fn rotation_resets_counters_and_kills_old_keys() {
        let (mut alice, mut bob) = handshaken_pair();

        let stale = alice.encrypt(b"pre-rotation").unwrap();
        assert_eq!(alice.send_counter(), 1);

        alice.rotate().unwrap();
        let new_key = alice.ratchet_public_key().unwrap();
        bob.apply_partner_rotation(&new_key).unwrap();

        assert_eq!(alice.send_counter(), 0);
        assert_eq!(bob.partner_counter(), 0);

        // The pre-rotation ciphertext is dead: bob's chain was re-derived.
        assert!(bob
            .decrypt(&stale.ciphertext, &stale.nonce, stale.counter)
            .is_err());

        // Post-rotation traffic flows in both directions.
        let sealed = alice.encrypt(b"fresh").unwrap();
        assert_eq!(sealed.counter, 1);
        assert_eq!(
            bob.decrypt(&sealed.ciphertext, &sealed.nonce, sealed.counter)
                .unwrap(),
            b"fresh"
        );
        let reply = bob.encrypt(b"ack").unwrap();
        assert_eq!(
            alice
                .decrypt(&reply.ciphertext, &reply.nonce, reply.counter)
                .unwrap(),
            b"ack"
        );
    }

    #[test]
    fn rotate_requires_established_session() {
        let mut engine = SessionCrypto::generate().unwrap();
        assert!(engine.rotate().is_err());
    }

    #[test]
    fn encrypt_without_chain_fails() {
        let mut engine = SessionCrypto::generate().unwrap();
        assert!(matches!(
            engine.encrypt(b"hi"),
            Err(CryptoError::NotInitialised(_))
        ));
    }

    #[test]
    fn clear_is_idempotent() {
        let (mut alice, _bob) = handshaken_pair();
        alice.clear();
        alice.clear();
        assert!(alice.public_keys().is_err());
        assert!(alice.encrypt(b"hi").is_err());
    }
}
