//! page — ключ страницы и неизменяемые версии страниц.
//!
//! - PageKey     — (space_id, page_no), логический слот страницы.
//! - PageVersion — образ страницы на момент применения всего WAL до `lsn`.
//!   Образ разделяется через Arc и никогда не мутирует после создания.

use std::fmt;
use std::sync::Arc;

/// Identifies one logical page slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub space_id: u32,
    pub page_no: u32,
}

impl PageKey {
    pub const fn new(space_id: u32, page_no: u32) -> Self {
        Self { space_id, page_no }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space_id, self.page_no)
    }
}

/// One immutable page image, valid as of `lsn`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageVersion {
    pub lsn: u64,
    pub data: Arc<[u8]>,
}

impl PageVersion {
    pub fn new(lsn: u64, data: Vec<u8>) -> Self {
        Self {
            lsn,
            data: Arc::from(data.into_boxed_slice()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Base image for a key with no stored version.
#[inline]
pub fn zero_page(page_size: usize) -> Vec<u8> {
    vec![0u8; page_size]
}

/// Page sizes accepted by the store: power of two in [MIN_PAGE_SIZE, MAX_PAGE_SIZE].
pub fn validate_page_size(ps: usize) -> bool {
    use crate::consts::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
    ps.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps)
}
