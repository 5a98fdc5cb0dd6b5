//! The logical record type the WAL, memtable, and resolver all speak.
//!
//! See spec §3 for the field list and invariants, and SPEC_FULL §4 for the
//! binary entry layout committed to here (the original spec deliberately
//! leaves the exact shape open; a stable on-disk format has to pick one).

use crate::error::{Error, Result};

/// The kind of mutation a record represents (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Insert = 0,
    Update = 1,
    Delete = 2,
    Checkpoint = 3,
    TxBegin = 4,
    TxCommit = 5,
    TxAbort = 6,
}

impl Operation {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Operation::Insert),
            1 => Ok(Operation::Update),
            2 => Ok(Operation::Delete),
            3 => Ok(Operation::Checkpoint),
            4 => Ok(Operation::TxBegin),
            5 => Ok(Operation::TxCommit),
            6 => Ok(Operation::TxAbort),
            _ => Err(Error::SerializationError("unknown operation tag")),
        }
    }

    /// Whether this operation marks the key as deleted (a tombstone).
    pub fn is_tombstone(self) -> bool {
        matches!(self, Operation::Delete)
    }
}

/// A tenant-scoped logical key (spec §3).
///
/// The sort key is `tenant | 0x00 | entity` so that scans by tenant are
/// contiguous; a single `0x00` separator is forbidden inside either
/// component (checked by `Key::new`) so the composite key round-trips
/// unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub tenant: String,
    pub entity: String,
}

impl Key {
    pub fn new(tenant: impl Into<String>, entity: impl Into<String>) -> Result<Self> {
        let tenant = tenant.into();
        let entity = entity.into();
        if tenant.contains('\0') || entity.contains('\0') {
            return Err(Error::SerializationError(
                "tenant/entity must not contain a NUL byte",
            ));
        }
        Ok(Self { tenant, entity })
    }

    /// `tenant | 0x00 | entity`, the prefix a tenant-scoped scan matches.
    pub fn tenant_prefix(tenant: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(tenant.len() + 1);
        out.extend_from_slice(tenant.as_bytes());
        out.push(0);
        out
    }

    pub fn sort_prefix(&self) -> Vec<u8> {
        let mut out = Self::tenant_prefix(&self.tenant);
        out.extend_from_slice(self.entity.as_bytes());
        out
    }

    /// The memtable's composite sort key: `tenant | 0x00 | entity | 0x00 |
    /// version_be(8) | timestamp_be(8)`. Big-endian integers sort the same
    /// as their numeric order, so ascending key order is ascending version
    /// order within one logical key.
    pub fn composite_key(&self, version: u64, timestamp_ns: u64) -> Vec<u8> {
        let mut out = self.sort_prefix();
        out.push(0);
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&timestamp_ns.to_be_bytes());
        out
    }
}

/// One durable mutation (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub operation: Operation,
    pub payload: Vec<u8>,
    pub version: u64,
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub txn_id: u64,
}

/// Encodes a record's fields into the WAL entry byte layout (SPEC_FULL §4):
/// `sequence:u64, version:u64, timestamp_ns:u64, txn_id:u64, operation:u8,
/// tenant_len:u32, tenant, entity_len:u32, entity, payload_len:u32, payload`.
/// All integers little-endian. This is the payload a WAL frame's CRC covers.
pub fn encode_entry(record: &Record) -> Vec<u8> {
    let tenant = record.key.tenant.as_bytes();
    let entity = record.key.entity.as_bytes();
    let mut out = Vec::with_capacity(
        8 + 8 + 8 + 8 + 1 + 4 + tenant.len() + 4 + entity.len() + 4 + record.payload.len(),
    );
    out.extend_from_slice(&record.sequence.to_le_bytes());
    out.extend_from_slice(&record.version.to_le_bytes());
    out.extend_from_slice(&record.timestamp_ns.to_le_bytes());
    out.extend_from_slice(&record.txn_id.to_le_bytes());
    out.push(record.operation as u8);
    out.extend_from_slice(&(tenant.len() as u32).to_le_bytes());
    out.extend_from_slice(tenant);
    out.extend_from_slice(&(entity.len() as u32).to_le_bytes());
    out.extend_from_slice(entity);
    out.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&record.payload);
    out
}

/// Decodes a WAL entry payload into a `Record`. Inverse of `encode_entry`.
///
/// # Errors
///
/// `Error::SerializationError` if the buffer is truncated, contains a
/// length field pointing past the end of the buffer, non-UTF-8 tenant/entity
/// bytes, or an unrecognized operation tag.
pub fn decode_entry(buf: &[u8]) -> Result<Record> {
    let mut cursor = Cursor::new(buf);
    let sequence = cursor.take_u64()?;
    let version = cursor.take_u64()?;
    let timestamp_ns = cursor.take_u64()?;
    let txn_id = cursor.take_u64()?;
    let operation = Operation::from_tag(cursor.take_u8()?)?;
    let tenant = cursor.take_string()?;
    let entity = cursor.take_string()?;
    let payload = cursor.take_bytes()?.to_vec();
    if !cursor.is_empty() {
        return Err(Error::SerializationError("trailing bytes after entry"));
    }
    Ok(Record {
        key: Key::new(tenant, entity)?,
        operation,
        payload,
        version,
        sequence,
        timestamp_ns,
        txn_id,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(Error::SerializationError("length overflow"))?;
        if end > self.buf.len() {
            return Err(Error::SerializationError("entry truncated"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| Error::SerializationError("bad u64"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| Error::SerializationError("bad u32"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn take_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }

    fn take_string(&mut self) -> Result<String> {
        let bytes = self.take_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::SerializationError("non-utf8 tenant/entity"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            key: Key::new("acme", "widget-1").unwrap(),
            operation: Operation::Insert,
            payload: b"hello".to_vec(),
            version: 7,
            sequence: 42,
            timestamp_ns: 1_000_000,
            txn_id: 0,
        }
    }

    #[test]
    fn round_trips() {
        let record = sample();
        let encoded = encode_entry(&record);
        let decoded = decode_entry(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn round_trips_empty_payload() {
        let mut record = sample();
        record.payload.clear();
        let encoded = encode_entry(&record);
        assert_eq!(decode_entry(&encoded).unwrap(), record);
    }

    #[test]
    fn rejects_truncated_buffer() {
        let encoded = encode_entry(&sample());
        let truncated = &encoded[..encoded.len() - 3];
        assert!(matches!(
            decode_entry(truncated),
            Err(Error::SerializationError(_))
        ));
    }

    #[test]
    fn rejects_unknown_operation_tag() {
        let mut encoded = encode_entry(&sample());
        // operation tag sits right after the four u64 fields.
        encoded[32] = 0xFF;
        assert!(matches!(
            decode_entry(&encoded),
            Err(Error::SerializationError(_))
        ));
    }

    #[test]
    fn rejects_nul_in_tenant() {
        assert!(Key::new("ac\0me", "e").is_err());
    }

    #[test]
    fn composite_key_orders_by_version() {
        let key = Key::new("acme", "widget").unwrap();
        let low = key.composite_key(1, 100);
        let high = key.composite_key(2, 50);
        assert!(low < high, "ascending version must sort ascending");
    }

    #[test]
    fn tenant_prefix_is_contiguous() {
        let a = Key::new("tenantA", "e1").unwrap();
        let b = Key::new("tenantA", "e2").unwrap();
        let c = Key::new("tenantB", "e1").unwrap();
        let prefix = Key::tenant_prefix("tenantA");
        assert!(a.sort_prefix().starts_with(&prefix));
        assert!(b.sort_prefix().starts_with(&prefix));
        assert!(!c.sort_prefix().starts_with(&prefix));
    }
}
