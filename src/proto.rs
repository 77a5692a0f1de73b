//! proto — JSON-сообщения протокола page service и транспортное кодирование бинарных данных.
//!
//! Эндпоинты (см. consts.rs):
//!   POST /api/v1/get_page    GetPageRequest   -> GetPageResponse
//!   POST /api/v1/get_pages   GetPagesRequest  -> GetPagesResponse
//!   POST /api/v1/stream_wal  StreamWalRequest -> StreamWalResponse
//!   GET  /api/v1/ping                         -> PingResponse
//!
//! Бинарные поля (page_data, wal_data) — стандартный base64 с паддингом. Ошибка
//! декодирования — PageError::Malformed, данные никогда не обрезаются молча.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{PageError, Result};
use crate::page::PageKey;

/// Response status as it appears on the wire.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Ok,
    NotFound,
    NotApplied,
    Error,
}

impl Status {
    /// HTTP status code paired with this status.
    pub fn http_code(self) -> u16 {
        match self {
            Status::Success | Status::Ok => 200,
            Status::NotFound => 404,
            Status::NotApplied => 503,
            Status::Error => 400,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GetPageRequest {
    pub space_id: u32,
    pub page_no: u32,
    pub lsn: u64,
}

impl GetPageRequest {
    pub fn new(key: PageKey, lsn: u64) -> Self {
        Self {
            space_id: key.space_id,
            page_no: key.page_no,
            lsn,
        }
    }

    pub fn key(&self) -> PageKey {
        PageKey::new(self.space_id, self.page_no)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GetPageResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_lsn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_lsn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GetPageResponse {
    pub fn success(data: &[u8], page_lsn: u64) -> Self {
        Self {
            status: Status::Success,
            page_data: Some(encode_payload(data)),
            page_lsn: Some(page_lsn),
            last_applied_lsn: None,
            error: None,
        }
    }

    pub fn not_found() -> Self {
        Self::bare(Status::NotFound)
    }

    pub fn not_applied(last_applied_lsn: u64) -> Self {
        Self {
            last_applied_lsn: Some(last_applied_lsn),
            ..Self::bare(Status::NotApplied)
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Self::bare(Status::Error)
        }
    }

    fn bare(status: Status) -> Self {
        Self {
            status,
            page_data: None,
            page_lsn: None,
            last_applied_lsn: None,
            error: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GetPagesRequest {
    pub pages: Vec<GetPageRequest>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GetPagesResponse {
    pub status: Status,
    pub results: Vec<GetPageResponse>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StreamWalRequest {
    pub lsn: u64,
    pub wal_data: String,
    /// Legacy shorthand: with `page_no`, `wal_data` is a raw page image for that key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_no: Option<u32>,
}

impl StreamWalRequest {
    pub fn new(lsn: u64, payload: &[u8]) -> Self {
        Self {
            lsn,
            wal_data: encode_payload(payload),
            space_id: None,
            page_no: None,
        }
    }

    pub fn page_image(lsn: u64, key: PageKey, image: &[u8]) -> Self {
        Self {
            space_id: Some(key.space_id),
            page_no: Some(key.page_no),
            ..Self::new(lsn, image)
        }
    }

    /// Target key of the legacy shorthand, when both halves are present.
    pub fn legacy_key(&self) -> Option<PageKey> {
        match (self.space_id, self.page_no) {
            (Some(s), Some(p)) => Some(PageKey::new(s, p)),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StreamWalResponse {
    pub status: Status,
    pub last_applied_lsn: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PingResponse {
    pub status: Status,
    pub version: String,
    #[serde(default)]
    pub last_applied_lsn: u64,
}

/// Body for routing/parse failures that have no operation-specific shape.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: Status,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            error: msg.into(),
        }
    }
}

/// Binary -> transport-safe text.
pub fn encode_payload(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Transport-safe text -> binary.
pub fn decode_payload(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s.as_bytes())
        .map_err(|e| PageError::malformed(format!("base64 payload: {}", e)))
}
