//! Wire framing
//!
//! Frames are `MAGIC (4) | length (u32 BE) | JSON body`. Domain messages use
//! [`MessageCodec`]; the connection preamble is read and written byte-exact
//! so the socket can be handed to a raw protocol afterwards.
//!
//! The preamble authenticates both ends:
//! 1. dialer → listener: [`Hello`] with the dialer's key and nonce
//! 2. listener → dialer: [`Hello`], then a [`HelloProof`] over the dialer's nonce
//! 3. dialer → listener: [`HelloProof`] over the listener's nonce

use crate::crypto::{public_key_from_hex, sha256, verify_signature, KeyPair, PeerId};
use crate::network::error::P2pError;
use crate::network::message::{Message, MAGIC, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use secp256k1::PublicKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 8;

/// Largest preamble accepted
const MAX_HELLO_SIZE: usize = 4096;

/// Random bytes in a handshake challenge
const NONCE_LEN: usize = 32;

/// Prefix of every signed handshake digest
const PROOF_DOMAIN: &[u8] = b"chain-p2p/handshake/1";

/// Message codec for length-prefixed framing
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Message too large",
            ));
        }

        dst.reserve(HEADER_LEN + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(len);

        let msg = Message::from_bytes(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(msg))
    }
}

/// Connection preamble exchanged in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Sender's peer id
    pub peer_id: String,
    /// Sender's compressed public key, hex
    pub public_key: String,
    /// Address the sender accepts connections on
    pub listen_addr: String,
    /// Protocol requested for this stream; `None` for a plain connection
    pub protocol: Option<String>,
    /// Fresh challenge the other side must sign
    pub nonce: String,
}

impl Hello {
    pub fn new(key: &KeyPair, listen_addr: String, protocol: Option<String>) -> Self {
        Self {
            peer_id: key.peer_id().to_string(),
            public_key: key.public_key_hex(),
            listen_addr,
            protocol,
            nonce: hex::encode(rand::random::<[u8; NONCE_LEN]>()),
        }
    }

    /// The announced identity, checked against the announced key
    pub fn verified_peer(&self) -> Result<(PeerId, PublicKey), P2pError> {
        let peer: PeerId = self.peer_id.parse()?;
        let key = public_key_from_hex(&self.public_key)?;

        let derived = PeerId::from_public_key(&key);
        if derived != peer {
            return Err(P2pError::PeerIdMismatch {
                expected: peer.to_string(),
                actual: derived.to_string(),
            });
        }
        Ok((peer, key))
    }
}

/// Signature over the other side's [`Hello`] nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloProof {
    pub signature: String,
}

impl HelloProof {
    /// Answer `challenge` with `key`
    pub fn sign(key: &KeyPair, challenge: &str) -> Result<Self, P2pError> {
        let digest = proof_digest(challenge, &key.peer_id());
        Ok(Self {
            signature: hex::encode(key.sign(&digest)?),
        })
    }

    /// Check that `signer` answered our `challenge` with `key`
    pub fn verify(&self, signer: &PeerId, key: &PublicKey, challenge: &str) -> Result<(), P2pError> {
        let signature =
            hex::decode(&self.signature).map_err(|_| P2pError::BadHandshake(signer.to_string()))?;
        let digest = proof_digest(challenge, signer);

        match verify_signature(key, &digest, &signature) {
            Ok(true) => Ok(()),
            _ => Err(P2pError::BadHandshake(signer.to_string())),
        }
    }
}

fn proof_digest(challenge: &str, signer: &PeerId) -> Vec<u8> {
    let mut data = Vec::with_capacity(PROOF_DOMAIN.len() + challenge.len() + 64);
    data.extend_from_slice(PROOF_DOMAIN);
    data.extend_from_slice(challenge.as_bytes());
    data.extend_from_slice(signer.as_str().as_bytes());
    sha256(&data)
}

/// Write a preamble frame
pub async fn write_hello<W>(io: &mut W, hello: &Hello) -> Result<(), P2pError>
where
    W: AsyncWrite + Unpin,
{
    write_preamble(io, hello).await
}

/// Read exactly one preamble frame, consuming no bytes past it
pub async fn read_hello<R>(io: &mut R) -> Result<Hello, P2pError>
where
    R: AsyncRead + Unpin,
{
    read_preamble(io).await
}

pub async fn write_proof<W>(io: &mut W, proof: &HelloProof) -> Result<(), P2pError>
where
    W: AsyncWrite + Unpin,
{
    write_preamble(io, proof).await
}

pub async fn read_proof<R>(io: &mut R) -> Result<HelloProof, P2pError>
where
    R: AsyncRead + Unpin,
{
    read_preamble(io).await
}

async fn write_preamble<W, T>(io: &mut W, value: &T) -> Result<(), P2pError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(value)?;
    let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);

    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

async fn read_preamble<R, T>(io: &mut R) -> Result<T, P2pError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    io.read_exact(&mut header).await?;

    if header[..4] != MAGIC {
        return Err(P2pError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid magic bytes",
        )));
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_HELLO_SIZE {
        return Err(P2pError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Hello too large",
        )));
    }

    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::BlockRequest;

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec;
        let msg = Message::BlockRequest(BlockRequest {
            id: 1,
            from: 5,
            max: 10,
        });

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = MessageCodec;
        let mut full = BytesMut::new();
        codec
            .encode(Message::Transactions(vec![vec![1, 2, 3]]), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x01{"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_length() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(u32::MAX);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_hello_leaves_trailing_bytes() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hello = Hello::new(
            &KeyPair::generate(),
            "/ip4/127.0.0.1/tcp/1".into(),
            Some("/chain/ping/1.0.0".into()),
        );

        write_hello(&mut a, &hello).await.unwrap();
        a.write_all(b"tail").await.unwrap();

        assert_eq!(read_hello(&mut b).await.unwrap(), hello);
        let mut tail = [0u8; 4];
        b.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[test]
    fn test_hello_nonce_is_fresh() {
        let key = KeyPair::generate();
        let first = Hello::new(&key, "/ip4/127.0.0.1/tcp/1".into(), None);
        let second = Hello::new(&key, "/ip4/127.0.0.1/tcp/1".into(), None);
        assert_ne!(first.nonce, second.nonce);
        assert_eq!(first.nonce.len(), NONCE_LEN * 2);
    }

    #[test]
    fn test_hello_key_must_match_id() {
        let key = KeyPair::generate();
        let hello = Hello::new(&key, "/ip4/127.0.0.1/tcp/1".into(), None);
        assert_eq!(hello.verified_peer().unwrap().0, key.peer_id());

        // Someone else's id with our key
        let claimed = Hello {
            peer_id: KeyPair::generate().peer_id().to_string(),
            ..hello.clone()
        };
        assert!(matches!(
            claimed.verified_peer(),
            Err(P2pError::PeerIdMismatch { .. })
        ));

        let garbled = Hello {
            public_key: "02ff".into(),
            ..hello
        };
        assert!(garbled.verified_peer().is_err());
    }

    #[test]
    fn test_proof_binds_key_and_challenge() {
        let key = KeyPair::generate();
        let challenge = Hello::new(&KeyPair::generate(), String::new(), None).nonce;
        let proof = HelloProof::sign(&key, &challenge).unwrap();

        assert!(proof
            .verify(&key.peer_id(), &key.public_key, &challenge)
            .is_ok());

        // Replayed against a different challenge
        assert!(matches!(
            proof.verify(&key.peer_id(), &key.public_key, "00"),
            Err(P2pError::BadHandshake(_))
        ));

        // Signed by a key other than the claimed one
        let forger = KeyPair::generate();
        let forged = HelloProof::sign(&forger, &challenge).unwrap();
        assert!(forged
            .verify(&key.peer_id(), &key.public_key, &challenge)
            .is_err());

        let garbled = HelloProof {
            signature: "not hex".into(),
        };
        assert!(garbled
            .verify(&key.peer_id(), &key.public_key, &challenge)
            .is_err());
    }
}
