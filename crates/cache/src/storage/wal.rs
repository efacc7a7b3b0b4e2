// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Write-ahead log records for entry mutations. The byte layout is part of
//! the durability contract: records written by one node version must
//! replay on another.

use binary_layout::{Field, LayoutAs, binary_layout};
use byteview::ByteView;
use ember_core::{CacheError, EntryVersion};
use parking_lot::Mutex;
use strum::FromRepr;
use thiserror::Error;
use tracing::warn;

/// Record operation kinds. Byte ids are stable.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromRepr)]
pub enum WalOp {
    Create = 1,
    Update = 2,
    Delete = 3,
}

#[derive(Error, Debug)]
pub enum WalEncodingError {
    #[error("Invalid WAL op: {0}")]
    InvalidOp(u8),
}

impl LayoutAs<u8> for WalOp {
    type ReadError = WalEncodingError;
    type WriteError = WalEncodingError;

    fn try_read(v: u8) -> Result<Self, Self::ReadError> {
        Self::from_repr(v).ok_or(WalEncodingError::InvalidOp(v))
    }

    fn try_write(v: Self) -> Result<u8, Self::WriteError> {
        Ok(v as u8)
    }
}

/// Bits of [`DataRecord::flags`].
pub mod record_flags {
    /// Update was applied on the primary node for the partition.
    pub const PRIMARY: u8 = 1 << 0;
    /// Update came from preloading/rebalance rather than a user operation.
    pub const PRELOAD: u8 = 1 << 1;
    /// Value was brought in from the external store (read-through).
    pub const FROM_STORE: u8 = 1 << 2;
}

/// A single logged entry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub cache_id: u32,
    pub key: ByteView,
    /// Absent for deletes.
    pub value: Option<ByteView>,
    pub op: WalOp,
    /// Transaction id for transactional updates; absent on atomic ones.
    pub near_xid: Option<EntryVersion>,
    pub write_version: EntryVersion,
    pub expire_time: i64,
    pub partition: u32,
    pub update_counter: i64,
    pub flags: u8,
}

const WAL_MAGIC: u32 = 0xecb0_0e11;

/// Length marker for an absent value.
const NO_VALUE: u32 = u32::MAX;

binary_layout!(version_stamp, LittleEndian, {
    topology: u32,
    order: u64,
    node_order_dc: u32,
});

binary_layout!(data_record_header, LittleEndian, {
    // Validity marker.
    magic_marker: u32,
    cache_id: u32,
    // The mutation being logged; see WalOp.
    op: WalOp as u8,
    // See record_flags.
    flags: u8,
    // Whether near_xid carries a transaction id (the stamp bytes are
    // zeroed otherwise).
    near_present: u8,
    near_xid: version_stamp::NestedView,
    write_version: version_stamp::NestedView,
    expire_time: i64,
    partition: u32,
    update_counter: i64,
    key_len: u32,
    // NO_VALUE when the record carries no value (deletes).
    val_len: u32,
});

binary_layout!(data_record, LittleEndian, {
    header: data_record_header::NestedView,
    // Key bytes followed by value bytes.
    data: [u8],
});

fn write_stamp(mut view: version_stamp::View<&mut [u8]>, stamp: &EntryVersion) {
    view.topology_mut().write(stamp.topology());
    view.order_mut().write(stamp.order());
    view.node_order_dc_mut().write(stamp.node_order_dc());
}

fn read_stamp(view: version_stamp::View<&[u8]>) -> EntryVersion {
    EntryVersion::from_parts(
        view.topology().read(),
        view.order().read(),
        view.node_order_dc().read(),
    )
}

/// Serialized size of a record.
pub fn encoded_len(record: &DataRecord) -> usize {
    data_record::data::OFFSET
        + record.key.len()
        + record.value.as_ref().map_or(0, |v| v.len())
}

pub fn encode_record(record: &DataRecord) -> Vec<u8> {
    let mut buf = vec![0u8; encoded_len(record)];
    let mut view = data_record::View::new(&mut buf[..]);
    let mut header = view.header_mut();
    header.magic_marker_mut().write(WAL_MAGIC);
    header.cache_id_mut().write(record.cache_id);
    header
        .op_mut()
        .try_write(record.op)
        .expect("Failed to write WAL op");
    header.flags_mut().write(record.flags);
    header
        .near_present_mut()
        .write(record.near_xid.is_some() as u8);
    if let Some(xid) = &record.near_xid {
        write_stamp(header.near_xid_mut(), xid);
    }
    write_stamp(header.write_version_mut(), &record.write_version);
    header.expire_time_mut().write(record.expire_time);
    header.partition_mut().write(record.partition);
    header.update_counter_mut().write(record.update_counter);
    header.key_len_mut().write(record.key.len() as u32);
    header
        .val_len_mut()
        .write(record.value.as_ref().map_or(NO_VALUE, |v| v.len() as u32));

    let data = view.data_mut();
    data[..record.key.len()].copy_from_slice(record.key.as_ref());
    if let Some(value) = &record.value {
        data[record.key.len()..].copy_from_slice(value.as_ref());
    }
    buf
}

/// Decode one record starting at the head of `buf`. Returns the record and
/// the number of bytes consumed.
pub fn decode_record(buf: &[u8]) -> Result<(DataRecord, usize), CacheError> {
    if buf.len() < data_record::data::OFFSET {
        return Err(CacheError::Wal("truncated record header".into()));
    }
    let view = data_record::View::new(buf);
    let header = view.header();
    if header.magic_marker().read() != WAL_MAGIC {
        warn!("WAL record does not have a valid magic marker");
        return Err(CacheError::Wal("bad magic marker".into()));
    }
    let op = header
        .op()
        .try_read()
        .map_err(|e| CacheError::Wal(e.to_string()))?;
    let key_len = header.key_len().read() as usize;
    let val_len_raw = header.val_len().read();
    let val_len = if val_len_raw == NO_VALUE {
        0
    } else {
        val_len_raw as usize
    };
    let total = data_record::data::OFFSET + key_len + val_len;
    if buf.len() < total {
        return Err(CacheError::Wal("truncated record body".into()));
    }
    let near_xid = if header.near_present().read() != 0 {
        Some(read_stamp(header.near_xid()))
    } else {
        None
    };
    let data = &buf[data_record::data::OFFSET..total];
    let record = DataRecord {
        cache_id: header.cache_id().read(),
        key: ByteView::from(data[..key_len].to_vec()),
        value: (val_len_raw != NO_VALUE)
            .then(|| ByteView::from(data[key_len..].to_vec())),
        op,
        near_xid,
        write_version: read_stamp(header.write_version()),
        expire_time: header.expire_time().read(),
        partition: header.partition().read(),
        update_counter: header.update_counter().read(),
        flags: header.flags().read(),
    };
    Ok((record, total))
}

/// Pointer to an appended record: its byte offset in the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalPointer(pub u64);

/// Append-only, multi-producer record log.
pub trait Wal: Send + Sync {
    fn append(&self, record: &DataRecord) -> Result<WalPointer, CacheError>;
}

/// In-memory WAL. Appends are serialized on one buffer; replay decodes the
/// whole stream in append order.
pub struct MemWal {
    buf: Mutex<Vec<u8>>,
}

impl Default for MemWal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemWal {
    pub fn new() -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.buf.lock().len()
    }

    /// Decode every record in append order.
    pub fn replay(&self) -> Result<Vec<DataRecord>, CacheError> {
        let buf = self.buf.lock();
        let mut records = vec![];
        let mut offset = 0;
        while offset < buf.len() {
            let (record, consumed) = decode_record(&buf[offset..])?;
            records.push(record);
            offset += consumed;
        }
        Ok(records)
    }
}

impl Wal for MemWal {
    fn append(&self, record: &DataRecord) -> Result<WalPointer, CacheError> {
        let encoded = encode_record(record);
        let mut buf = self.buf.lock();
        let ptr = WalPointer(buf.len() as u64);
        buf.extend_from_slice(&encoded);
        Ok(ptr)
    }
}
