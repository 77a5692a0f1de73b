//! WAL ingest — декодирование записей, applier и applied-watermark.
//!
//! Разделение:
//! - record.rs    — формат payload (QPW1), PageOp/WalRecord, строгая валидация.
//! - watermark.rs — AppliedWatermark (монотонный, по непрерывному префиксу LSN).
//! - applier.rs   — ограниченная упорядоченная очередь + фоновый поток применения.

pub mod applier;
pub mod record;
pub mod watermark;

pub use applier::{apply_record, ApplyOutcome, WalApplier};
pub use record::{PageOp, WalRecord};
pub use watermark::Watermark;
