use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use uuid::Uuid;

/// Decoding helpers for the composite values used in wire messages. Fixed-width getters come from
///  [Buf] itself, varints from `bytes_varint`.
pub trait BufExt: Buf + VarIntSupport {
    fn try_get_string(&mut self) -> anyhow::Result<String> {
        let raw = self.try_get_len_prefixed()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    fn try_get_opt_string(&mut self) -> anyhow::Result<Option<String>> {
        if self.try_get_presence()? {
            Ok(Some(self.try_get_string()?))
        }
        else {
            Ok(None)
        }
    }

    fn try_get_len_prefixed(&mut self) -> anyhow::Result<Bytes> {
        let len = self.try_get_usize_varint()?;
        if self.remaining() < len {
            bail!("buffer underflow: expected {} bytes, {} remaining", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_get_opt_len_prefixed(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.try_get_presence()? {
            Ok(Some(self.try_get_len_prefixed()?))
        }
        else {
            Ok(None)
        }
    }

    fn try_get_uuid(&mut self) -> anyhow::Result<Uuid> {
        Ok(Uuid::from_u128(self.try_get_u128()?))
    }

    fn try_get_presence(&mut self) -> anyhow::Result<bool> {
        match self.try_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => bail!("invalid presence marker {}", n),
        }
    }
}

pub trait BufMutExt: BufMut + VarIntSupportMut {
    fn put_string(&mut self, s: &str) {
        self.put_len_prefixed(s.as_bytes());
    }

    fn put_opt_string(&mut self, s: Option<&str>) {
        self.put_presence(s.is_some());
        if let Some(s) = s {
            self.put_string(s);
        }
    }

    fn put_len_prefixed(&mut self, data: &[u8]) {
        self.put_usize_varint(data.len());
        self.put_slice(data);
    }

    fn put_opt_len_prefixed(&mut self, data: Option<&[u8]>) {
        self.put_presence(data.is_some());
        if let Some(data) = data {
            self.put_len_prefixed(data);
        }
    }

    fn put_uuid(&mut self, uuid: &Uuid) {
        self.put_u128(uuid.as_u128());
    }

    fn put_presence(&mut self, present: bool) {
        self.put_u8(if present { 1 } else { 0 });
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::a("a", vec![1,97])]
    #[case::abc("abc", vec![3,97,98,99])]
    #[case::umlaut("ä", vec![2,0xc3,0xa4])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.put_string(s);
        assert_eq!(&buf, &expected);

        let mut deser_buf = buf.freeze();
        let deser = deser_buf.try_get_string().unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_try_get_string_too_short() {
        let mut buf = Bytes::from_static(b"\x02a");
        assert!(buf.try_get_string().is_err());
    }

    #[test]
    fn test_try_get_string_not_unicode() {
        let mut buf = Bytes::from_static(b"\x02\xc0\xaf");
        assert!(buf.try_get_string().is_err());
    }

    #[rstest]
    #[case::absent(None, vec![0])]
    #[case::present(Some("x"), vec![1, 1, 120])]
    fn test_opt_string(#[case] s: Option<&str>, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.put_opt_string(s);
        assert_eq!(&buf, &expected);
        assert_eq!(buf.freeze().try_get_opt_string().unwrap().as_deref(), s);
    }

    #[test]
    fn test_invalid_presence_marker() {
        let mut buf = Bytes::from_static(b"\x07");
        assert!(buf.try_get_opt_string().is_err());
    }

    #[test]
    fn test_uuid() {
        let uuid = Uuid::new_v4();
        let mut buf = BytesMut::new();
        buf.put_uuid(&uuid);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.freeze().try_get_uuid().unwrap(), uuid);
    }
}
