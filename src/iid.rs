use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::base::{BufLoc, Key, Payload};
use crate::error::{Error, Result};

/// Fixed fields at the head of an identifier record: key, domain
/// length, identifier length.
const IID_FIXED: usize = 12;

/// Materialized identifier bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IidData {
    /// The identifier proper.
    pub iid: Vec<u8>,
    /// Qualifier for the identifier; empty means absent.
    pub domain: Vec<u8>,
}

/// Opaque byte string naming one object, with an optional domain
/// qualifier. The container never interprets either byte string; two
/// identifiers are the same iff their `iid` bytes are equal.
///
/// Identifiers read from a file stay unloaded until fetched.
#[derive(Debug, Clone)]
pub struct Iid {
    pub(crate) key: Key,
    pub(crate) state: Payload<IidData>,
}

impl Iid {
    pub fn new(iid: impl Into<Vec<u8>>) -> Self {
        Iid {
            key: 0,
            state: Payload::Loaded(IidData {
                iid: iid.into(),
                domain: Vec::new(),
            }),
        }
    }

    pub fn with_domain(iid: impl Into<Vec<u8>>, domain: impl Into<Vec<u8>>) -> Self {
        Iid {
            key: 0,
            state: Payload::Loaded(IidData {
                iid: iid.into(),
                domain: domain.into(),
            }),
        }
    }

    pub(crate) fn unloaded(key: Key, loc: BufLoc) -> Self {
        Iid {
            key,
            state: Payload::Unloaded(loc),
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_loaded()
    }

    /// Identifier bytes; `None` until fetched.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.state.get().map(|data| data.iid.as_slice())
    }

    /// Domain bytes; `None` until fetched, or when the identifier
    /// carries no domain.
    pub fn domain(&self) -> Option<&[u8]> {
        match self.state.get() {
            Some(data) if !data.domain.is_empty() => Some(data.domain.as_slice()),
            _ => None,
        }
    }
}

pub(crate) fn encode(key: Key, data: &IidData, buf: &mut Vec<u8>) {
    buf.write_u32::<LittleEndian>(key).expect("vec write");
    buf.write_u32::<LittleEndian>(data.domain.len() as u32).expect("vec write");
    buf.write_u32::<LittleEndian>(data.iid.len() as u32).expect("vec write");
    buf.extend_from_slice(&data.domain);
    buf.extend_from_slice(&data.iid);
}

/// Decode one identifier record. The stored key must match the lookup
/// table key the record was reached through.
pub(crate) fn decode(buf: &[u8], expected: Key) -> Result<IidData> {
    if buf.len() < IID_FIXED {
        return Err(Error::CorruptLayout(format!(
            "identifier record of {} bytes is shorter than its fixed fields",
            buf.len()
        )));
    }

    let mut reader = buf;
    let key = reader.read_u32::<LittleEndian>()?;
    if key != expected {
        return Err(Error::CorruptLayout(format!(
            "identifier record stores key {}, reached through key {}",
            key, expected
        )));
    }

    let domain_len = reader.read_u32::<LittleEndian>()? as usize;
    let iid_len = reader.read_u32::<LittleEndian>()? as usize;
    if IID_FIXED + domain_len + iid_len != buf.len() {
        return Err(Error::CorruptLayout(format!(
            "identifier record of {} bytes does not hold {} domain and {} identifier bytes",
            buf.len(),
            domain_len,
            iid_len
        )));
    }

    let domain = buf[IID_FIXED..IID_FIXED + domain_len].to_vec();
    let iid = buf[IID_FIXED + domain_len..].to_vec();
    Ok(IidData { iid, domain })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mut buf = Vec::new();
        encode(
            5,
            &IidData {
                iid: b"\x00\x01".to_vec(),
                domain: b"d".to_vec(),
            },
            &mut buf,
        );
        assert_eq!(buf.len(), IID_FIXED + 3);

        let data = decode(&buf, 5).expect("decode failed");
        assert_eq!(data.iid, b"\x00\x01");
        assert_eq!(data.domain, b"d");
    }

    #[test]
    fn empty_domain_is_absent() {
        let mut buf = Vec::new();
        encode(0, &IidData { iid: b"x".to_vec(), domain: Vec::new() }, &mut buf);

        let data = decode(&buf, 0).expect("decode failed");
        let iid = Iid {
            key: 0,
            state: Payload::Loaded(data),
        };
        assert_eq!(iid.bytes(), Some(b"x".as_slice()));
        assert_eq!(iid.domain(), None);
    }

    #[test]
    fn decode_rejects_key_mismatch() {
        let mut buf = Vec::new();
        encode(1, &IidData { iid: b"x".to_vec(), domain: Vec::new() }, &mut buf);
        assert!(decode(&buf, 2).is_err());
    }

    #[test]
    fn decode_rejects_bad_lengths() {
        let mut buf = Vec::new();
        encode(0, &IidData { iid: b"abc".to_vec(), domain: Vec::new() }, &mut buf);
        buf.truncate(buf.len() - 1);
        assert!(decode(&buf, 0).is_err());
    }
}
