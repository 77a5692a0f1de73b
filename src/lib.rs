#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod error;
pub mod metrics;
pub mod config;

// Модульная раскладка (папки с mod.rs)
pub mod page;   // src/page/mod.rs
pub mod index;  // src/index/{mod,pins,compact}.rs
pub mod wal;    // src/wal/{mod,record,watermark,applier}.rs
pub mod server; // src/server/{mod,http}.rs
pub mod client; // src/client/{mod,conn,retry}.rs

// Wire format (JSON + base64)
pub mod proto;

// Удобные реэкспорты
pub use client::{FetchedPage, PageRequest, RemotePageClient, StreamAck};
pub use config::{AckMode, ClientConfig, ServerConfig};
pub use error::{PageError, Result};
pub use index::PageIndex;
pub use page::{PageKey, PageVersion};
pub use server::{HttpServer, PageService};
pub use wal::{PageOp, WalRecord};
