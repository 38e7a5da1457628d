//! Pluggable identity handling for the connection handshake and for opening channels.
//!
//! The initiating side turns an optional [Subject] into an opaque token with an
//!  [IdentityProvider]; the accepting side validates the token and recovers the subject with an
//!  [IdentityAsserter]. Anything the asserter rejects is reported to the remote side as a plain
//!  'connection rejected'.

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::ExtendError;
use crate::util::buf_ext::{BufExt, BufMutExt};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// An authenticated identity: the set of principal names it is known by
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Subject {
    pub principals: Vec<String>,
}

impl Subject {
    pub fn new(principals: impl IntoIterator<Item = impl Into<String>>) -> Subject {
        Subject {
            principals: principals.into_iter().map(Into::into).collect(),
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    fn create_token(&self, subject: Option<&Subject>) -> Result<Option<Bytes>, ExtendError>;
}

pub trait IdentityAsserter: Send + Sync {
    /// Validates a token, returning the subject it represents. Failures must be reported as
    ///  [ExtendError::Security].
    fn assert_identity(&self, token: Option<&[u8]>) -> Result<Option<Subject>, ExtendError>;
}

fn ser_principals(subject: &Subject, buf: &mut BytesMut) {
    buf.put_usize_varint(subject.principals.len());
    for p in &subject.principals {
        buf.put_string(p);
    }
}

fn deser_principals(buf: &mut &[u8]) -> anyhow::Result<Subject> {
    let len = buf.try_get_usize_varint()?;
    let mut principals = Vec::new();
    for _ in 0..len {
        principals.push(buf.try_get_string()?);
    }
    Ok(Subject { principals })
}

/// Passes the subject's principals in the clear and accepts whatever arrives, including no
///  token at all. Suitable for trusted networks and tests.
#[derive(Debug, Default)]
pub struct DefaultIdentity {}

impl IdentityProvider for DefaultIdentity {
    fn create_token(&self, subject: Option<&Subject>) -> Result<Option<Bytes>, ExtendError> {
        Ok(subject.map(|s| {
            let mut buf = BytesMut::new();
            ser_principals(s, &mut buf);
            buf.freeze()
        }))
    }
}

impl IdentityAsserter for DefaultIdentity {
    fn assert_identity(&self, token: Option<&[u8]>) -> Result<Option<Subject>, ExtendError> {
        let Some(mut token) = token else {
            return Ok(None);
        };
        let subject = deser_principals(&mut token)
            .map_err(|e| ExtendError::security(format!("malformed identity token: {}", e)))?;
        Ok(Some(subject))
    }
}

/// Signs the subject's principals with a secret shared by both sides: the token is the
///  serialized principals followed by `SHA-256(secret || principals)`. A token is required.
pub struct SharedSecretIdentity {
    secret: Vec<u8>,
}

impl SharedSecretIdentity {
    const DIGEST_LEN: usize = 32;

    pub fn new(secret: impl Into<Vec<u8>>) -> SharedSecretIdentity {
        SharedSecretIdentity {
            secret: secret.into(),
        }
    }

    fn digest(&self, principals: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(principals);
        hasher.finalize().into()
    }
}

impl IdentityProvider for SharedSecretIdentity {
    fn create_token(&self, subject: Option<&Subject>) -> Result<Option<Bytes>, ExtendError> {
        let mut buf = BytesMut::new();
        ser_principals(subject.unwrap_or(&Subject::default()), &mut buf);
        let digest = self.digest(&buf);
        buf.extend_from_slice(&digest);
        Ok(Some(buf.freeze()))
    }
}

impl IdentityAsserter for SharedSecretIdentity {
    fn assert_identity(&self, token: Option<&[u8]>) -> Result<Option<Subject>, ExtendError> {
        let token = token
            .ok_or_else(|| ExtendError::security("missing identity token"))?;
        if token.len() < Self::DIGEST_LEN {
            return Err(ExtendError::security("identity token is too short"));
        }

        let (principals, digest) = token.split_at(token.len() - Self::DIGEST_LEN);
        let expected = self.digest(principals);
        // compare all bytes regardless of where the first difference is
        let diff = expected.iter().zip(digest)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(ExtendError::security("identity token signature mismatch"));
        }

        let mut principals = principals;
        let subject = deser_principals(&mut principals)
            .map_err(|e| ExtendError::security(format!("malformed identity token: {}", e)))?;
        Ok(Some(subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identity() {
        let identity = DefaultIdentity::default();
        assert_eq!(identity.create_token(None).unwrap(), None);
        assert_eq!(identity.assert_identity(None).unwrap(), None);

        let subject = Subject::new(["alice", "admins"]);
        let token = identity.create_token(Some(&subject)).unwrap().unwrap();
        assert_eq!(identity.assert_identity(Some(&token)).unwrap(), Some(subject));
    }

    #[test]
    fn test_default_identity_malformed_token() {
        let result = DefaultIdentity::default().assert_identity(Some(b"\x05"));
        assert!(matches!(result, Err(ExtendError::Security { .. })));
    }

    #[test]
    fn test_shared_secret_roundtrip() {
        let identity = SharedSecretIdentity::new(b"secret".to_vec());
        let subject = Subject::new(["bob"]);

        let token = identity.create_token(Some(&subject)).unwrap().unwrap();
        assert_eq!(identity.assert_identity(Some(&token)).unwrap(), Some(subject));
    }

    #[test]
    fn test_shared_secret_rejects_other_secret() {
        let token = SharedSecretIdentity::new(b"secret".to_vec())
            .create_token(Some(&Subject::new(["bob"]))).unwrap().unwrap();

        let result = SharedSecretIdentity::new(b"other".to_vec()).assert_identity(Some(&token));
        assert_eq!(result, Err(ExtendError::security("identity token signature mismatch")));
    }

    #[test]
    fn test_shared_secret_rejects_tampered_principals() {
        let identity = SharedSecretIdentity::new(b"secret".to_vec());
        let mut token = identity.create_token(Some(&Subject::new(["bob"]))).unwrap().unwrap().to_vec();
        token[2] = b'r';

        assert!(identity.assert_identity(Some(&token)).is_err());
    }

    #[test]
    fn test_shared_secret_requires_token() {
        let identity = SharedSecretIdentity::new(b"secret".to_vec());
        assert_eq!(identity.assert_identity(None), Err(ExtendError::security("missing identity token")));
        assert!(identity.assert_identity(Some(b"short")).is_err());
    }
}
