use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use super::{CodecError, Protection};
use crate::crypto::{open, seal, PublicKey, Secret, SecretKey, Signature, SIGNATURE_SIZE};
use crate::model::{Flags, RealmPolicy};

/// Size of the plaintext routing prefix
pub const PREFIX_SIZE: usize = 8;

/// Marks a routing prefix as the short id of a home realm recipient
pub const HOME_TAG: u64 = 1 << 63;

// size, mod time, flags, name length, attrs length, short author id
const FIXED_SIZE: usize = 8 + 8 + 4 + 2 + 4 + 8;

/// Metadata of one file version as written in its header
#[derive(Debug, Clone, PartialEq)]
pub struct Head {
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub flags: Flags,
    pub attrs: Vec<u8>,
}

/// A decrypted header whose signature is not checked yet
///
/// The header names its author by short id only, so the reader has to
/// resolve the full key before calling [`SignedHead::verify`].
#[derive(Debug, Clone)]
pub struct SignedHead {
    head: Head,
    key_id: u64,
    author_id: u64,
    payload: Vec<u8>,
}

impl SignedHead {
    pub fn author_id(&self) -> u64 {
        self.author_id
    }

    /// Routing prefix the header was stored under.
    pub fn key_id(&self) -> u64 {
        self.key_id
    }

    pub fn verify(self, author: &PublicKey) -> Result<Head, CodecError> {
        if author.short_id() != self.author_id {
            return Err(CodecError::Signature);
        }
        let (signed, signature) = self.payload.split_at(self.payload.len() - SIGNATURE_SIZE);
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(signature);
        author
            .verify(signed, &Signature::from_bytes(&bytes))
            .map_err(|_| CodecError::Signature)?;
        Ok(self.head)
    }
}

/// Sign `head` as `identity` and protect it.
pub fn encode_head(
    identity: &SecretKey,
    head: &Head,
    protection: &Protection,
) -> Result<Vec<u8>, CodecError> {
    let name = head.name.as_bytes();
    let name_len = u16::try_from(name.len())
        .map_err(|_| CodecError::Malformed(format!("name too long: {} bytes", name.len())))?;
    let attrs_len = u32::try_from(head.attrs.len())
        .map_err(|_| CodecError::Malformed("attributes too large".into()))?;

    let mut payload =
        Vec::with_capacity(FIXED_SIZE + name.len() + head.attrs.len() + SIGNATURE_SIZE);
    payload.extend_from_slice(&head.size.to_le_bytes());
    payload.extend_from_slice(&(head.mod_time.timestamp_millis().max(0) as u64).to_le_bytes());
    payload.extend_from_slice(&(head.flags & Flags::PERSISTENT).bits().to_le_bytes());
    payload.extend_from_slice(&name_len.to_le_bytes());
    payload.extend_from_slice(&attrs_len.to_le_bytes());
    payload.extend_from_slice(&identity.public().short_id().to_le_bytes());
    payload.extend_from_slice(name);
    payload.extend_from_slice(&head.attrs);
    let signature = identity.sign(&payload);
    payload.extend_from_slice(&signature.to_bytes());

    let protected = match protection {
        Protection::Plain => payload,
        Protection::Group { key, .. } => key.encrypt(&payload)?,
        Protection::Home { recipient } => seal(recipient, &payload)?,
    };

    let mut out = Vec::with_capacity(PREFIX_SIZE + protected.len());
    out.extend_from_slice(&protection.key_id().to_le_bytes());
    out.extend_from_slice(&protected);
    Ok(out)
}

/// Open a header.
///
/// Returns `Ok(None)` when the header is addressed to someone else or
/// encrypted with a key this reader does not hold.
pub fn decode_head(
    data: &[u8],
    policy: RealmPolicy,
    identity: &SecretKey,
    keys: &HashMap<u64, Secret>,
) -> Result<Option<SignedHead>, CodecError> {
    if data.len() < PREFIX_SIZE {
        return Err(CodecError::Truncated("header prefix"));
    }
    let key_id = read_u64(&data[..PREFIX_SIZE]);
    let rest = &data[PREFIX_SIZE..];

    let payload = match policy {
        RealmPolicy::Public => {
            if key_id != 0 {
                return Err(CodecError::Malformed(format!(
                    "unexpected routing prefix {:x} in public realm",
                    key_id
                )));
            }
            rest.to_vec()
        }
        RealmPolicy::Home => {
            if key_id != identity.public().short_id() | HOME_TAG {
                return Ok(None);
            }
            open(identity, rest)?
        }
        RealmPolicy::Group => match keys.get(&key_id) {
            Some(key) => key.decrypt(rest)?,
            None => return Ok(None),
        },
    };

    if payload.len() < FIXED_SIZE + SIGNATURE_SIZE {
        return Err(CodecError::Truncated("header"));
    }
    let size = read_u64(&payload[0..8]);
    let mod_time_ms = read_u64(&payload[8..16]);
    let flags = u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]);
    let name_len = u16::from_le_bytes([payload[20], payload[21]]) as usize;
    let attrs_len =
        u32::from_le_bytes([payload[22], payload[23], payload[24], payload[25]]) as usize;
    let author_id = read_u64(&payload[26..34]);

    if payload.len() != FIXED_SIZE + name_len + attrs_len + SIGNATURE_SIZE {
        return Err(CodecError::Truncated("header fields"));
    }
    let name_end = FIXED_SIZE + name_len;
    let name = std::str::from_utf8(&payload[FIXED_SIZE..name_end])
        .map_err(|e| CodecError::Malformed(e.to_string()))?
        .to_string();
    let attrs = payload[name_end..name_end + attrs_len].to_vec();
    let mod_time = Utc
        .timestamp_millis_opt(mod_time_ms as i64)
        .single()
        .ok_or_else(|| CodecError::Malformed(format!("bad timestamp {}", mod_time_ms)))?;

    Ok(Some(SignedHead {
        head: Head {
            name,
            size,
            mod_time,
            flags: Flags::from_bits(flags) & Flags::PERSISTENT,
            attrs,
        },
        key_id,
        author_id,
        payload,
    }))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buff = [0u8; 8];
    buff.copy_from_slice(bytes);
    u64::from_le_bytes(buff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(attrs: &[u8], flags: Flags) -> Head {
        Head {
            name: "docs/report.txt".into(),
            size: 11,
            mod_time: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            flags,
            attrs: attrs.to_vec(),
        }
    }

    #[test]
    fn test_round_trip_every_policy() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();
        let key = Secret::generate();
        let keys = HashMap::from([(42u64, key.clone())]);

        let cases = [
            (RealmPolicy::Public, Protection::Plain, Flags::NONE),
            (
                RealmPolicy::Group,
                Protection::Group { key_id: 42, key },
                Flags::SYMMETRIC,
            ),
            (
                RealmPolicy::Home,
                Protection::Home {
                    recipient: bob.public(),
                },
                Flags::EC,
            ),
        ];
        for (policy, protection, flags) in cases {
            for attrs in [&b""[..], &b"color=blue"[..]] {
                let original = head(attrs, flags);
                let data = encode_head(&alice, &original, &protection).unwrap();
                let signed = decode_head(&data, policy, &bob, &keys).unwrap().unwrap();
                assert_eq!(signed.key_id(), protection.key_id());
                assert_eq!(signed.author_id(), alice.public().short_id());
                assert_eq!(signed.verify(&alice.public()).unwrap(), original);
            }
        }
    }

    #[test]
    fn test_not_for_me() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();
        let carol = SecretKey::generate();

        let data = encode_head(
            &alice,
            &head(b"", Flags::EC),
            &Protection::Home {
                recipient: bob.public(),
            },
        )
        .unwrap();
        assert!(decode_head(&data, RealmPolicy::Home, &carol, &HashMap::new())
            .unwrap()
            .is_none());

        let data = encode_head(
            &alice,
            &head(b"", Flags::SYMMETRIC),
            &Protection::Group {
                key_id: 7,
                key: Secret::generate(),
            },
        )
        .unwrap();
        assert!(decode_head(&data, RealmPolicy::Group, &bob, &HashMap::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_tampering_is_detected() {
        let alice = SecretKey::generate();
        let data = encode_head(&alice, &head(b"x", Flags::NONE), &Protection::Plain).unwrap();
        let keys = HashMap::new();

        for idx in 0..data.len() {
            let mut tampered = data.clone();
            tampered[idx] ^= 0x01;
            let verified = decode_head(&tampered, RealmPolicy::Public, &alice, &keys)
                .and_then(|signed| match signed {
                    Some(signed) => signed.verify(&alice.public()).map(Some),
                    None => Ok(None),
                });
            assert!(!matches!(verified, Ok(Some(_))), "byte {} not covered", idx);
        }

        let signed = decode_head(&data, RealmPolicy::Public, &alice, &keys)
            .unwrap()
            .unwrap();
        assert!(signed.verify(&SecretKey::generate().public()).is_err());

        assert!(decode_head(&data[..20], RealmPolicy::Public, &alice, &keys).is_err());
        assert!(decode_head(&data[..5], RealmPolicy::Public, &alice, &keys).is_err());
    }
}
