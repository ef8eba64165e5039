use super::{CodecError, Protection, Unlock};
use crate::crypto::{derive_nonce, open, seal, NONCE_SIZE};
use crate::model::{split_name, strip_version};

/// Where a body is stored; group realm nonces are derived from it
#[derive(Debug, Clone, Copy)]
pub struct BodyContext<'a> {
    pub realm: &'a str,
    /// Logical name, with or without a version suffix
    pub name: &'a str,
    /// Physical object name, unique per version
    pub store_name: &'a str,
}

impl BodyContext<'_> {
    fn nonce(&self, key_id: u64) -> [u8; NONCE_SIZE] {
        let (_, base) = split_name(strip_version(self.name));
        derive_nonce(&[
            self.realm.as_bytes(),
            &key_id.to_le_bytes(),
            base.as_bytes(),
            self.store_name.as_bytes(),
        ])
    }
}

pub fn encode_body(
    ctx: &BodyContext<'_>,
    protection: &Protection,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    Ok(match protection {
        Protection::Plain => data.to_vec(),
        Protection::Group { key_id, key } => key.encrypt_with_nonce(&ctx.nonce(*key_id), data)?,
        Protection::Home { recipient } => seal(recipient, data)?,
    })
}

pub fn decode_body(
    ctx: &BodyContext<'_>,
    unlock: Unlock<'_>,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    Ok(match unlock {
        Unlock::Plain => data.to_vec(),
        Unlock::Group { key_id, key } => key.decrypt_with_nonce(&ctx.nonce(key_id), data)?,
        Unlock::Home { identity } => open(identity, data)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Secret, SecretKey};

    const CTX: BodyContext<'static> = BodyContext {
        realm: "users",
        name: "docs/a.txt",
        store_name: "k2j4v",
    };

    #[test]
    fn test_group_body() {
        let key = Secret::generate();
        let protection = Protection::Group {
            key_id: 9,
            key: key.clone(),
        };
        let data = encode_body(&CTX, &protection, b"Hello World").unwrap();
        assert_ne!(&data[..11], b"Hello World");

        let unlock = Unlock::Group {
            key_id: 9,
            key: &key,
        };
        assert_eq!(decode_body(&CTX, unlock, &data).unwrap(), b"Hello World");

        // same name, another version: another nonce
        let other = BodyContext {
            store_name: "k2j4w",
            ..CTX
        };
        assert!(decode_body(&other, unlock, &data).is_err());
        let again = encode_body(&other, &protection, b"Hello World").unwrap();
        assert_ne!(again, data);
    }

    #[test]
    fn test_version_suffix_is_ignored() {
        let key = Secret::generate();
        let protection = Protection::Group {
            key_id: 1,
            key: key.clone(),
        };
        let data = encode_body(&CTX, &protection, b"abc").unwrap();
        let versioned = BodyContext {
            name: "docs/a.txt:3",
            ..CTX
        };
        let unlock = Unlock::Group {
            key_id: 1,
            key: &key,
        };
        assert_eq!(decode_body(&versioned, unlock, &data).unwrap(), b"abc");
    }

    #[test]
    fn test_home_body() {
        let bob = SecretKey::generate();
        let protection = Protection::Home {
            recipient: bob.public(),
        };
        let data = encode_body(&CTX, &protection, b"for bob").unwrap();
        let unlock = Unlock::Home { identity: &bob };
        assert_eq!(decode_body(&CTX, unlock, &data).unwrap(), b"for bob");

        let carol = SecretKey::generate();
        assert!(decode_body(&CTX, Unlock::Home { identity: &carol }, &data).is_err());
    }
}
