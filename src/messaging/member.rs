use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut};

use crate::util::buf_ext::{BufExt, BufMutExt};

/// Describes the process on either end of a connection. All parts are informational, they are
///  exchanged during the handshake and show up in diagnostics.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Member {
    pub name: Option<String>,
    pub role: Option<String>,
    pub address: Option<String>,
}

impl Member {
    pub fn named(name: impl Into<String>) -> Member {
        Member {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_opt_string(self.name.as_deref());
        buf.put_opt_string(self.role.as_deref());
        buf.put_opt_string(self.address.as_deref());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Member> {
        Ok(Member {
            name: buf.try_get_opt_string()?,
            role: buf.try_get_opt_string()?,
            address: buf.try_get_opt_string()?,
        })
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Member({}", self.name.as_deref().unwrap_or("?"))?;
        if let Some(role) = &self.role {
            write!(f, ", role={}", role)?;
        }
        if let Some(address) = &self.address {
            write!(f, ", address={}", address)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty(Member::default(), "Member(?)")]
    #[case::named(Member::named("a"), "Member(a)")]
    #[case::full(Member { name: Some("a".to_string()), role: Some("proxy".to_string()), address: Some("10.0.0.1:9099".to_string()) }, "Member(a, role=proxy, address=10.0.0.1:9099)")]
    fn test_ser_display(#[case] member: Member, #[case] display: &str) {
        assert_eq!(member.to_string(), display);

        let mut buf = BytesMut::new();
        member.ser(&mut buf);
        let mut buf = buf.freeze();
        assert_eq!(Member::try_deser(&mut buf).unwrap(), member);
        assert!(buf.is_empty());
    }
}
