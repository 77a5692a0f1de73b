//! wal/record — бинарный формат WAL-записи (physical redo), кодирование и валидация.
//!
//! Формат payload (LE), см. consts.rs:
//!   header  : [magic4 "QPW1"][op_count u16][reserved u16]
//!   op      : [kind u8][space_id u32][page_no u32][offset u32][len u32][bytes...]
//!   trailer : [crc32c u32] по header + ops
//!
//! Операции:
//! - PAGE_IMAGE — полная замена страницы (offset=0, len<=page_size, хвост добивается нулями);
//! - PAGE_WRITE — патч len байт по offset (offset+len <= page_size);
//! - PAGE_ZERO  — обнуление страницы (offset=len=0).
//!
//! Декодирование строгое: любая неконсистентность (магия, обрезка, лишние байты, неизвестный
//! тип, выход за границы страницы, CRC) даёт PageError::Malformed ещё до постановки в очередь.

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{
    WAL_OP_HDR_SIZE, WAL_OP_PAGE_IMAGE, WAL_OP_PAGE_WRITE, WAL_OP_PAGE_ZERO,
    WAL_PAYLOAD_HDR_SIZE, WAL_PAYLOAD_MAGIC, WAL_PAYLOAD_TRAILER_SIZE,
};
use crate::error::{PageError, Result};
use crate::page::PageKey;

/// One page mutation inside a WAL record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageOp {
    /// Replace the page; short images are zero-padded.
    Image { key: PageKey, data: Vec<u8> },
    /// Patch bytes at `offset`.
    Write {
        key: PageKey,
        offset: u32,
        bytes: Vec<u8>,
    },
    /// Reset the page to zeros.
    Zero { key: PageKey },
}

impl PageOp {
    pub fn key(&self) -> PageKey {
        match self {
            PageOp::Image { key, .. } | PageOp::Write { key, .. } | PageOp::Zero { key } => *key,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            PageOp::Image { .. } => WAL_OP_PAGE_IMAGE,
            PageOp::Write { .. } => WAL_OP_PAGE_WRITE,
            PageOp::Zero { .. } => WAL_OP_PAGE_ZERO,
        }
    }

    /// Apply onto a full page image in place. Bounds were validated at decode time.
    pub fn apply_to(&self, page: &mut [u8]) {
        match self {
            PageOp::Image { data, .. } => {
                let n = data.len().min(page.len());
                page[..n].copy_from_slice(&data[..n]);
                page[n..].fill(0);
            }
            PageOp::Write { offset, bytes, .. } => {
                let off = *offset as usize;
                page[off..off + bytes.len()].copy_from_slice(bytes);
            }
            PageOp::Zero { .. } => page.fill(0),
        }
    }

    fn check_bounds(&self, page_size: usize) -> Result<()> {
        match self {
            PageOp::Image { key, data } if data.len() > page_size => Err(PageError::malformed(
                format!(
                    "PAGE_IMAGE for {} is {} bytes (page size {})",
                    key,
                    data.len(),
                    page_size
                ),
            )),
            PageOp::Write { key, offset, bytes } => {
                let end = *offset as u64 + bytes.len() as u64;
                if end > page_size as u64 {
                    return Err(PageError::malformed(format!(
                        "PAGE_WRITE for {} out of bounds: offset={} len={} (page size {})",
                        key,
                        offset,
                        bytes.len(),
                        page_size
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// One durable log entry: LSN + zero or more page ops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: u64,
    pub ops: Vec<PageOp>,
}

impl WalRecord {
    pub fn new(lsn: u64, ops: Vec<PageOp>) -> Self {
        Self { lsn, ops }
    }

    /// Record carrying one full page image (legacy request shorthand).
    pub fn single_image(lsn: u64, key: PageKey, data: Vec<u8>) -> Self {
        Self::new(lsn, vec![PageOp::Image { key, data }])
    }

    /// Distinct affected keys in op order.
    pub fn affected_keys(&self) -> Vec<PageKey> {
        let mut keys: Vec<PageKey> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let k = op.key();
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys
    }

    /// Ops touching `key`, in payload order.
    pub fn ops_for(&self, key: PageKey) -> impl Iterator<Item = &PageOp> {
        self.ops.iter().filter(move |op| op.key() == key)
    }

    /// Check every op against the page size.
    pub fn validate(&self, page_size: usize) -> Result<()> {
        for op in &self.ops {
            op.check_bounds(page_size)?;
        }
        Ok(())
    }

    /// Encode the payload (the LSN travels next to it, not inside).
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        if self.ops.len() > u16::MAX as usize {
            return Err(PageError::malformed(format!(
                "too many ops in one record: {}",
                self.ops.len()
            )));
        }
        let body: usize = self
            .ops
            .iter()
            .map(|op| WAL_OP_HDR_SIZE + op_bytes(op).len())
            .sum();
        let mut out = Vec::with_capacity(WAL_PAYLOAD_HDR_SIZE + body + WAL_PAYLOAD_TRAILER_SIZE);

        let mut hdr = [0u8; WAL_PAYLOAD_HDR_SIZE];
        hdr[..4].copy_from_slice(WAL_PAYLOAD_MAGIC);
        LittleEndian::write_u16(&mut hdr[4..6], self.ops.len() as u16);
        out.extend_from_slice(&hdr);

        for op in &self.ops {
            let bytes = op_bytes(op);
            if bytes.len() > u32::MAX as usize {
                return Err(PageError::malformed("op payload too large"));
            }
            let key = op.key();
            let offset = match op {
                PageOp::Write { offset, .. } => *offset,
                _ => 0,
            };
            let mut oh = [0u8; WAL_OP_HDR_SIZE];
            oh[0] = op.kind();
            LittleEndian::write_u32(&mut oh[1..5], key.space_id);
            LittleEndian::write_u32(&mut oh[5..9], key.page_no);
            LittleEndian::write_u32(&mut oh[9..13], offset);
            LittleEndian::write_u32(&mut oh[13..17], bytes.len() as u32);
            out.extend_from_slice(&oh);
            out.extend_from_slice(bytes);
        }

        let crc = crc32c::crc32c(&out);
        let mut tr = [0u8; WAL_PAYLOAD_TRAILER_SIZE];
        LittleEndian::write_u32(&mut tr, crc);
        out.extend_from_slice(&tr);
        Ok(out)
    }

    /// Decode and validate a payload for `lsn`.
    pub fn decode(lsn: u64, payload: &[u8], page_size: usize) -> Result<Self> {
        if payload.len() < WAL_PAYLOAD_HDR_SIZE + WAL_PAYLOAD_TRAILER_SIZE {
            return Err(PageError::malformed(format!(
                "WAL payload too short: {} bytes",
                payload.len()
            )));
        }
        if &payload[..4] != WAL_PAYLOAD_MAGIC {
            return Err(PageError::malformed("bad WAL payload magic"));
        }

        let body_end = payload.len() - WAL_PAYLOAD_TRAILER_SIZE;
        let crc_expected = LittleEndian::read_u32(&payload[body_end..]);
        let crc_actual = crc32c::crc32c(&payload[..body_end]);
        if crc_actual != crc_expected {
            return Err(PageError::malformed(format!(
                "WAL payload CRC mismatch at lsn {} (expected {:08x}, got {:08x})",
                lsn, crc_expected, crc_actual
            )));
        }

        let op_count = LittleEndian::read_u16(&payload[4..6]) as usize;
        let mut ops = Vec::with_capacity(op_count);
        let mut pos = WAL_PAYLOAD_HDR_SIZE;

        for i in 0..op_count {
            if pos + WAL_OP_HDR_SIZE > body_end {
                return Err(PageError::malformed(format!(
                    "WAL payload truncated in op {} header",
                    i
                )));
            }
            let oh = &payload[pos..pos + WAL_OP_HDR_SIZE];
            let kind = oh[0];
            let key = PageKey::new(
                LittleEndian::read_u32(&oh[1..5]),
                LittleEndian::read_u32(&oh[5..9]),
            );
            let offset = LittleEndian::read_u32(&oh[9..13]);
            let len = LittleEndian::read_u32(&oh[13..17]) as usize;
            pos += WAL_OP_HDR_SIZE;

            if len > body_end - pos {
                return Err(PageError::malformed(format!(
                    "WAL payload truncated in op {} data ({} bytes declared)",
                    i, len
                )));
            }
            let bytes = payload[pos..pos + len].to_vec();
            pos += len;

            let op = match kind {
                WAL_OP_PAGE_IMAGE => {
                    if offset != 0 {
                        return Err(PageError::malformed(format!(
                            "PAGE_IMAGE with non-zero offset {}",
                            offset
                        )));
                    }
                    PageOp::Image { key, data: bytes }
                }
                WAL_OP_PAGE_WRITE => PageOp::Write { key, offset, bytes },
                WAL_OP_PAGE_ZERO => {
                    if offset != 0 || len != 0 {
                        return Err(PageError::malformed("PAGE_ZERO must carry no data"));
                    }
                    PageOp::Zero { key }
                }
                other => {
                    return Err(PageError::malformed(format!(
                        "unknown WAL op kind {}",
                        other
                    )))
                }
            };
            op.check_bounds(page_size)?;
            ops.push(op);
        }

        if pos != body_end {
            return Err(PageError::malformed(format!(
                "{} trailing byte(s) after {} op(s)",
                body_end - pos,
                op_count
            )));
        }

        Ok(Self { lsn, ops })
    }
}

fn op_bytes(op: &PageOp) -> &[u8] {
    match op {
        PageOp::Image { data, .. } => data,
        PageOp::Write { bytes, .. } => bytes,
        PageOp::Zero { .. } => &[],
    }
}
