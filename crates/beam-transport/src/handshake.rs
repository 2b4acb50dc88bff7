//! Mutually authenticated key agreement.
//!
//! ```text
//! responder -> initiator : MAGIC || s_r              (hello, also answers probes)
//! initiator -> responder : MAGIC || e_i || s_i
//! responder -> initiator : e_r
//! ```
//!
//! Both sides then derive directional keys with HKDF-SHA256 over
//! `DH(e_i, e_r) || DH(e_i, s_r) || DH(s_i, e_r)`, salted with the SHA-256
//! transcript hash. Only holders of both static secrets can compute the same
//! keys; the sealed confirmation frames exchanged afterwards prove it.
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Firewall, Keypair, PublicKey, TransportError, BEAM_MAGIC};

/// Length of the responder hello.
pub(crate) const HELLO_LEN: usize = 8 + 32;
/// Length of the initiator message.
const INIT_LEN: usize = 8 + 32 + 32;

const INFO_I2R: &[u8] = b"beam/t/1 initiator->responder";
const INFO_R2I: &[u8] = b"beam/t/1 responder->initiator";

/// Plaintext of the key-confirmation frame each side seals after the handshake.
pub(crate) const CONFIRM: &[u8] = b"beam/t/1 confirm";

/// Directional session keys.
pub(crate) struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

/// Run the responder side. Returns the session keys and the initiator's static key.
pub(crate) async fn respond<S>(
    stream: &mut S,
    local: &Keypair,
    firewall: &Firewall,
) -> Result<(SessionKeys, PublicKey), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; HELLO_LEN];
    hello[..8].copy_from_slice(BEAM_MAGIC);
    hello[8..].copy_from_slice(local.public().as_bytes());
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut init = [0u8; INIT_LEN];
    stream.read_exact(&mut init).await?;
    check_magic(&init[..8])?;
    let remote_ephemeral = key_at(&init, 8);
    let remote_static = key_at(&init, 40);

    if !firewall(&remote_static) {
        return Err(TransportError::Rejected(remote_static));
    }

    let ephemeral = Keypair::generate();
    stream.write_all(ephemeral.public().as_bytes()).await?;
    stream.flush().await?;

    let transcript = transcript(
        &local.public(),
        &remote_ephemeral,
        &remote_static,
        &ephemeral.public(),
    );
    let ee = ephemeral.diffie_hellman(&remote_ephemeral);
    let es = local.diffie_hellman(&remote_ephemeral);
    let se = ephemeral.diffie_hellman(&remote_static);
    let (i2r, r2i) = derive_keys(&transcript, &ee, &es, &se);

    Ok((
        SessionKeys {
            send: r2i,
            recv: i2r,
        },
        remote_static,
    ))
}

/// Run the initiator side against a responder expected to hold `expected`.
pub(crate) async fn initiate<S>(
    stream: &mut S,
    local: &Keypair,
    expected: &PublicKey,
) -> Result<SessionKeys, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_static = read_hello(stream).await?;
    if remote_static != *expected {
        return Err(TransportError::IdentityMismatch {
            expected: *expected,
            actual: remote_static,
        });
    }

    let ephemeral = Keypair::generate();
    let mut init = [0u8; INIT_LEN];
    init[..8].copy_from_slice(BEAM_MAGIC);
    init[8..40].copy_from_slice(ephemeral.public().as_bytes());
    init[40..].copy_from_slice(local.public().as_bytes());
    stream.write_all(&init).await?;
    stream.flush().await?;

    let mut reply = [0u8; 32];
    stream.read_exact(&mut reply).await?;
    let remote_ephemeral = PublicKey::from_bytes(reply);

    let transcript = transcript(
        &remote_static,
        &ephemeral.public(),
        &local.public(),
        &remote_ephemeral,
    );
    let ee = ephemeral.diffie_hellman(&remote_ephemeral);
    let es = ephemeral.diffie_hellman(&remote_static);
    let se = local.diffie_hellman(&remote_ephemeral);
    let (i2r, r2i) = derive_keys(&transcript, &ee, &es, &se);

    Ok(SessionKeys {
        send: i2r,
        recv: r2i,
    })
}

/// Read the responder hello and return the advertised static key.
pub(crate) async fn read_hello<S>(stream: &mut S) -> Result<PublicKey, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut hello).await?;
    check_magic(&hello[..8])?;
    Ok(key_at(&hello, 8))
}

fn check_magic(bytes: &[u8]) -> Result<(), TransportError> {
    if bytes != BEAM_MAGIC {
        return Err(TransportError::Handshake("unexpected protocol magic".into()));
    }
    Ok(())
}

fn key_at(buf: &[u8], offset: usize) -> PublicKey {
    let mut key = [0u8; 32];
    key.copy_from_slice(&buf[offset..offset + 32]);
    PublicKey::from_bytes(key)
}

fn transcript(
    responder_static: &PublicKey,
    initiator_ephemeral: &PublicKey,
    initiator_static: &PublicKey,
    responder_ephemeral: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(BEAM_MAGIC);
    hasher.update(responder_static.as_bytes());
    hasher.update(initiator_ephemeral.as_bytes());
    hasher.update(initiator_static.as_bytes());
    hasher.update(responder_ephemeral.as_bytes());
    hasher.finalize().into()
}

fn derive_keys(
    transcript: &[u8; 32],
    ee: &[u8; 32],
    es: &[u8; 32],
    se: &[u8; 32],
) -> ([u8; 32], [u8; 32]) {
    let mut ikm = [0u8; 96];
    ikm[..32].copy_from_slice(ee);
    ikm[32..64].copy_from_slice(es);
    ikm[64..].copy_from_slice(se);

    let hkdf = Hkdf::<Sha256>::new(Some(&transcript[..]), &ikm);
    let mut i2r = [0u8; 32];
    let mut r2i = [0u8; 32];
    hkdf.expand(INFO_I2R, &mut i2r)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    hkdf.expand(INFO_R2I, &mut r2i)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    (i2r, r2i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn allow_all() -> Firewall {
        Arc::new(|_: &PublicKey| true)
    }

    #[tokio::test]
    async fn both_sides_agree_on_keys() {
        let responder = Keypair::generate();
        let initiator = Keypair::generate();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let expected = responder.public();
        let initiator_id = initiator.public();
        let init = tokio::spawn(async move { initiate(&mut a, &initiator, &expected).await });
        let (resp_keys, remote) = respond(&mut b, &responder, &allow_all()).await.unwrap();
        let init_keys = init.await.unwrap().unwrap();

        assert_eq!(init_keys.send, resp_keys.recv);
        assert_eq!(init_keys.recv, resp_keys.send);
        assert_ne!(init_keys.send, init_keys.recv);
        assert_eq!(remote, initiator_id);
    }

    #[tokio::test]
    async fn initiator_rejects_unexpected_responder() {
        let responder = Keypair::generate();
        let impostor = Keypair::generate();
        let initiator = Keypair::generate();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let expected = responder.public();
        tokio::spawn(async move {
            let _ = respond(&mut b, &impostor, &allow_all()).await;
        });

        match initiate(&mut a, &initiator, &expected).await {
            Err(TransportError::IdentityMismatch { expected: e, .. }) => assert_eq!(e, expected),
            Err(e) => panic!("expected IdentityMismatch, got: {e}"),
            Ok(_) => panic!("expected IdentityMismatch, got keys"),
        }
    }

    #[tokio::test]
    async fn responder_firewall_rejects_initiator() {
        let responder = Keypair::generate();
        let initiator = Keypair::generate();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let expected = responder.public();
        tokio::spawn(async move {
            let _ = initiate(&mut a, &initiator, &expected).await;
        });

        let deny: Firewall = Arc::new(|_: &PublicKey| false);
        let result = respond(&mut b, &responder, &deny).await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        b.write_all(&[0u8; HELLO_LEN]).await.unwrap();
        let result = read_hello(&mut a).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }
}
