//! Общие константы (страницы, протокол, формат WAL-записи).

// -------- Pages --------
/// Default page size (InnoDB-style 16 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

// -------- Protocol --------
/// Reported by Ping.
pub const PROTOCOL_VERSION: &str = "1.0.0";

pub const DEFAULT_PORT: u16 = 8080;

pub const PATH_GET_PAGE: &str = "/api/v1/get_page";
pub const PATH_GET_PAGES: &str = "/api/v1/get_pages";
pub const PATH_STREAM_WAL: &str = "/api/v1/stream_wal";
pub const PATH_PING: &str = "/api/v1/ping";
pub const PATH_METRICS: &str = "/metrics";
pub const PATH_HEALTH: &str = "/health";

/// Upper bound for a request body accepted by the HTTP front-end.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;
/// Upper bound for a response body read by the client.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

// -------- WAL record payload --------
// Layout (LE):
// header  : [magic4 = "QPW1"][op_count u16][reserved u16]
// op      : [kind u8][space_id u32][page_no u32][offset u32][len u32][bytes...]
// trailer : [crc32c u32] -- over header + ops
pub const WAL_PAYLOAD_MAGIC: &[u8; 4] = b"QPW1";
pub const WAL_PAYLOAD_HDR_SIZE: usize = 8;
pub const WAL_OP_HDR_SIZE: usize = 17;
pub const WAL_PAYLOAD_TRAILER_SIZE: usize = 4;

// Типы операций:
pub const WAL_OP_PAGE_IMAGE: u8 = 1;
pub const WAL_OP_PAGE_WRITE: u8 = 2;
pub const WAL_OP_PAGE_ZERO: u8 = 3;
