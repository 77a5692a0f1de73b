//! client — RemotePageClient: мост между промахом локального page cache / сбросом WAL
//! и удалённым page service.
//!
//! Разделение:
//! - mod.rs   — RemotePageClient (жизненный цикл, GetPage/StreamWAL/Ping, batch).
//! - conn.rs  — keep-alive HTTP/1.1 соединение поверх TcpStream.
//! - retry.rs — RetryPolicy (ограниченные попытки, backoff, общий дедлайн).
//!
//! Жизненный цикл:
//! - init() никогда не падает: без адреса клиент выключен; если стартовый ping не прошёл —
//!   предупреждение в лог и клиент выключен;
//! - выключенный клиент не делает I/O: GetPage -> Disabled, StreamWAL -> Skipped;
//! - shutdown() закрывает соединение и выключает клиент.
//!
//! Соединение одно: запрос берёт его «в аренду» (ConnLease), в полёте не больше одного.
//! Ожидание занятого соединения ограничено дедлайном вызывающего: StreamWAL не застревает
//! за зависшим GetPage, а уходит в Degraded. Мёртвое keep-alive соединение
//! переподключается прозрачно.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::consts::{PATH_GET_PAGE, PATH_GET_PAGES, PATH_PING, PATH_STREAM_WAL};
use crate::error::{PageError, Result};
use crate::metrics::{
    record_client_get_page_failure, record_client_reconnect, record_client_wal_degraded,
};
use crate::page::PageKey;
use crate::proto::{
    decode_payload, GetPageRequest, GetPageResponse, GetPagesRequest, GetPagesResponse,
    PingResponse, Status, StreamWalRequest, StreamWalResponse,
};

pub mod conn;
pub mod retry;

pub use conn::Endpoint;
pub use retry::{Failure, RetryPolicy};

use conn::HttpConn;

/// Page image fetched from the service, with the LSN of the version actually returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedPage {
    pub data: Vec<u8>,
    pub page_lsn: u64,
}

/// One entry of a batch fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub key: PageKey,
    pub lsn: u64,
}

impl PageRequest {
    pub fn new(space_id: u32, page_no: u32, lsn: u64) -> Self {
        Self {
            key: PageKey::new(space_id, page_no),
            lsn,
        }
    }
}

/// Result of shipping a WAL record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamAck {
    /// The service queued the record; watermark at acknowledgement time.
    Acked { last_applied_lsn: u64 },
    /// Client disabled, nothing sent.
    Skipped,
    /// Service unreachable or too slow; local commit proceeds without it.
    Degraded { reason: String },
}

impl StreamAck {
    pub fn is_acked(&self) -> bool {
        matches!(self, StreamAck::Acked { .. })
    }
}

pub struct RemotePageClient {
    cfg: ClientConfig,
    endpoint: Option<Endpoint>,
    enabled: AtomicBool,
    slot: Mutex<ConnSlot>,
    slot_free: Condvar,
    connected_once: AtomicBool,
}

#[derive(Default)]
struct ConnSlot {
    conn: Option<HttpConn>,
    // соединение выдано запросу
    busy: bool,
}

/// Exclusive use of the connection for one exchange; hands it back on drop.
struct ConnLease<'a> {
    client: &'a RemotePageClient,
    conn: Option<HttpConn>,
}

impl Drop for ConnLease<'_> {
    fn drop(&mut self) {
        let mut slot = self.client.lock_slot();
        slot.busy = false;
        if self.client.is_enabled() {
            slot.conn = self.conn.take();
        }
        drop(slot);
        self.client.slot_free.notify_one();
    }
}

impl RemotePageClient {
    /// Build the client and run one liveness check. Never fails; see `is_enabled`.
    pub fn init(cfg: ClientConfig) -> Self {
        let endpoint = match cfg.address.as_deref() {
            None => {
                info!("page service client disabled: no address configured");
                None
            }
            Some(addr) => match Endpoint::parse(addr) {
                Ok(ep) => Some(ep),
                Err(e) => {
                    warn!("page service client disabled: {}", e);
                    None
                }
            },
        };

        let client = Self {
            enabled: AtomicBool::new(endpoint.is_some()),
            endpoint,
            cfg,
            slot: Mutex::new(ConnSlot::default()),
            slot_free: Condvar::new(),
            connected_once: AtomicBool::new(false),
        };

        if let Some(ep) = &client.endpoint {
            match client.ping_inner() {
                Ok(p) => info!(
                    "page service at {} is up (version {}, applied lsn {})",
                    ep.authority(),
                    p.version,
                    p.last_applied_lsn
                ),
                Err(e) => {
                    warn!(
                        "page service at {} unreachable, client disabled: {}",
                        ep.authority(),
                        e
                    );
                    client.disable();
                }
            }
        }
        client
    }

    /// Configured with an address and the startup ping succeeded (and not shut down).
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    /// Close the connection and disable the client. Idempotent.
    pub fn shutdown(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            info!("page service client shut down");
        }
        self.drop_conn();
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.drop_conn();
    }

    fn drop_conn(&self) {
        self.lock_slot().conn = None;
    }

    // the slot holds no invariant a panic could break: recover from poisoning
    fn lock_slot(&self) -> MutexGuard<'_, ConnSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the connection, waiting for a concurrent exchange no longer than `deadline`.
    fn checkout(&self, deadline: Instant) -> std::result::Result<ConnLease<'_>, Failure> {
        let mut slot = self.lock_slot();
        while slot.busy {
            let now = Instant::now();
            if now >= deadline {
                return Err(Failure::Transient("connection busy".into()));
            }
            slot = match self.slot_free.wait_timeout(slot, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        slot.busy = true;
        Ok(ConnLease {
            client: self,
            conn: slot.conn.take(),
        })
    }

    fn check_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(PageError::Disabled)
        }
    }

    /// Liveness/version of the service.
    pub fn ping(&self) -> Result<PingResponse> {
        self.check_enabled()?;
        self.ping_inner()
    }

    fn ping_inner(&self) -> Result<PingResponse> {
        let policy = RetryPolicy::for_requests(&self.cfg);
        policy.run("ping", |_, deadline| {
            let (_, body) = self.exchange("GET", PATH_PING, None, deadline)?;
            let p: PingResponse = parse_body(&body)?;
            match p.status {
                Status::Ok | Status::Success => Ok(p),
                other => Err(Failure::Fatal(PageError::malformed(format!(
                    "ping answered {:?}",
                    other
                )))),
            }
        })
    }

    /// Fetch the page version visible at `lsn`.
    pub fn get_page(&self, key: PageKey, lsn: u64) -> Result<FetchedPage> {
        self.check_enabled()?;
        let req = serde_json::to_vec(&GetPageRequest::new(key, lsn))
            .map_err(|e| PageError::malformed(format!("encode request: {}", e)))?;

        let policy = RetryPolicy::for_requests(&self.cfg);
        let res = policy.run("get_page", |_, deadline| {
            let (code, body) = self.exchange("POST", PATH_GET_PAGE, Some(&req), deadline)?;
            let resp: GetPageResponse = parse_response(code, &body)?;
            self.page_from_response(key, lsn, code, resp)
        });

        if let Err(e) = &res {
            if !e.is_not_found() {
                record_client_get_page_failure();
                debug!("get_page {}@{} failed: {}", key, lsn, e);
            }
        }
        res
    }

    /// Fetch several pages in one round trip. One result per request, in order.
    pub fn get_pages_batch(&self, reqs: &[PageRequest]) -> Vec<Result<FetchedPage>> {
        if reqs.is_empty() {
            return Vec::new();
        }
        if let Err(e) = self.check_enabled() {
            return reqs.iter().map(|_| Err(e.clone())).collect();
        }

        let body = GetPagesRequest {
            pages: reqs.iter().map(|r| GetPageRequest::new(r.key, r.lsn)).collect(),
        };
        let req = match serde_json::to_vec(&body) {
            Ok(b) => b,
            Err(e) => {
                let e = PageError::malformed(format!("encode request: {}", e));
                return reqs.iter().map(|_| Err(e.clone())).collect();
            }
        };

        let policy = RetryPolicy::for_requests(&self.cfg);
        let batch = policy.run("get_pages", |_, deadline| {
            let (code, body) = self.exchange("POST", PATH_GET_PAGES, Some(&req), deadline)?;
            let resp: GetPagesResponse = parse_response(code, &body)?;
            if resp.results.len() != reqs.len() {
                return Err(Failure::Fatal(PageError::malformed(format!(
                    "batch answered {} results for {} requests",
                    resp.results.len(),
                    reqs.len()
                ))));
            }
            Ok(resp.results)
        });

        match batch {
            Ok(results) => reqs
                .iter()
                .zip(results)
                .map(|(r, resp)| {
                    let code = resp.status.http_code();
                    self.page_from_response(r.key, r.lsn, code, resp)
                        .map_err(|f| match f {
                            Failure::Fatal(e) => e,
                            Failure::Transient(m) => PageError::Unavailable(m),
                        })
                })
                .collect(),
            Err(e) => {
                record_client_get_page_failure();
                reqs.iter().map(|_| Err(e.clone())).collect()
            }
        }
    }

    fn page_from_response(
        &self,
        key: PageKey,
        lsn: u64,
        code: u16,
        resp: GetPageResponse,
    ) -> std::result::Result<FetchedPage, Failure> {
        match resp.status {
            Status::Success | Status::Ok => {
                let (Some(data), Some(page_lsn)) = (resp.page_data, resp.page_lsn) else {
                    return Err(Failure::Fatal(PageError::malformed(
                        "success response without page_data/page_lsn",
                    )));
                };
                let data = decode_payload(&data).map_err(Failure::Fatal)?;
                if data.len() != self.cfg.page_size {
                    return Err(Failure::Fatal(PageError::malformed(format!(
                        "page {} is {} bytes, expected {}",
                        key,
                        data.len(),
                        self.cfg.page_size
                    ))));
                }
                if page_lsn > lsn {
                    return Err(Failure::Fatal(PageError::malformed(format!(
                        "page {} returned at lsn {} above requested {}",
                        key, page_lsn, lsn
                    ))));
                }
                Ok(FetchedPage { data, page_lsn })
            }
            Status::NotFound => Err(Failure::Fatal(PageError::NotFound(key))),
            Status::NotApplied => Err(Failure::Transient(format!(
                "lsn {} not applied yet (watermark {})",
                lsn,
                resp.last_applied_lsn.unwrap_or(0)
            ))),
            Status::Error => Err(server_error(code, resp.error)),
        }
    }

    /// Ship one WAL record (`payload` in the service's WAL payload format).
    ///
    /// Never blocks past the WAL deadline: unreachable or slow service degrades to a logged no-op.
    pub fn stream_wal(&self, lsn: u64, payload: &[u8]) -> Result<StreamAck> {
        self.send_wal(StreamWalRequest::new(lsn, payload))
    }

    /// Ship a full page image for `key` (the request's legacy shorthand).
    pub fn stream_page_image(&self, key: PageKey, lsn: u64, image: &[u8]) -> Result<StreamAck> {
        self.send_wal(StreamWalRequest::page_image(lsn, key, image))
    }

    fn send_wal(&self, req: StreamWalRequest) -> Result<StreamAck> {
        if !self.is_enabled() {
            return Ok(StreamAck::Skipped);
        }
        let lsn = req.lsn;
        let body = serde_json::to_vec(&req)
            .map_err(|e| PageError::malformed(format!("encode request: {}", e)))?;

        let policy = RetryPolicy::for_wal(&self.cfg);
        let res = policy.run("stream_wal", |_, deadline| {
            let (code, body) = self.exchange("POST", PATH_STREAM_WAL, Some(&body), deadline)?;
            let resp: StreamWalResponse = parse_response(code, &body)?;
            match resp.status {
                Status::Success | Status::Ok => Ok(resp.last_applied_lsn),
                _ => Err(server_error(code, resp.error)),
            }
        });

        match res {
            Ok(wm) => Ok(StreamAck::Acked {
                last_applied_lsn: wm,
            }),
            Err(PageError::Unavailable(reason)) => {
                record_client_wal_degraded();
                warn!(
                    "stream_wal lsn={}: page service unavailable, continuing without it: {}",
                    lsn, reason
                );
                Ok(StreamAck::Degraded { reason })
            }
            Err(e) => Err(e),
        }
    }

    /// One request/response on the shared connection, reconnecting if needed.
    ///
    /// Every wait (connection checkout, connect, socket I/O) is clamped to `deadline`.
    fn exchange(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
        deadline: Instant,
    ) -> std::result::Result<(u16, Vec<u8>), Failure> {
        let ep = self.endpoint.as_ref().ok_or(Failure::Fatal(PageError::Disabled))?;
        let mut lease = self.checkout(deadline)?;

        // reused keep-alive socket may have been closed by the server: one fresh retry
        let reused = lease.conn.is_some();
        for fresh in [false, true] {
            if fresh && !reused {
                break;
            }
            if lease.conn.is_none() || fresh {
                let remaining = time_left(deadline)?;
                let c = HttpConn::connect(
                    ep,
                    self.cfg.connect_timeout().min(remaining),
                    self.cfg.io_timeout().min(remaining),
                )
                .map_err(|e| Failure::Transient(format!("connect {}: {}", ep.authority(), e)))?;
                if self.connected_once.swap(true, Ordering::Relaxed) {
                    record_client_reconnect();
                }
                lease.conn = Some(c);
            }
            let remaining = match time_left(deadline) {
                Ok(r) => r,
                Err(f) => {
                    lease.conn = None;
                    return Err(f);
                }
            };
            let Some(c) = lease.conn.as_mut() else {
                continue;
            };
            if let Err(e) = c.set_io_timeout(self.cfg.io_timeout().min(remaining)) {
                lease.conn = None;
                return Err(Failure::Transient(format!("socket: {}", e)));
            }
            match c.request(method, path, body) {
                Ok(resp) => {
                    if resp.close {
                        lease.conn = None;
                    }
                    return Ok((resp.status, resp.body));
                }
                Err(e) => {
                    lease.conn = None;
                    if !fresh && reused && Instant::now() < deadline {
                        debug!("{} {}: stale connection ({}), reconnecting", method, path, e);
                        continue;
                    }
                    return Err(Failure::Transient(format!("{} {}: {}", method, path, e)));
                }
            }
        }
        Err(Failure::Transient(format!("{} {}: no connection", method, path)))
    }
}

fn time_left(deadline: Instant) -> std::result::Result<Duration, Failure> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        Err(Failure::Transient("deadline exceeded".into()))
    } else {
        Ok(remaining)
    }
}

impl Drop for RemotePageClient {
    fn drop(&mut self) {
        self.drop_conn();
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, Failure> {
    serde_json::from_slice(body)
        .map_err(|e| Failure::Fatal(PageError::malformed(format!("response: {}", e))))
}

/// Decode a JSON response; an undecodable 5xx body counts as a transient server failure.
fn parse_response<T: DeserializeOwned>(code: u16, body: &[u8]) -> std::result::Result<T, Failure> {
    match serde_json::from_slice(body) {
        Ok(v) => Ok(v),
        Err(_) if code >= 500 => Err(Failure::Transient(format!("server answered HTTP {}", code))),
        Err(e) => Err(Failure::Fatal(PageError::malformed(format!(
            "response (HTTP {}): {}",
            code, e
        )))),
    }
}

fn server_error(code: u16, msg: Option<String>) -> Failure {
    let msg = msg.unwrap_or_else(|| "unspecified server error".to_string());
    if code >= 500 {
        Failure::Transient(msg)
    } else {
        Failure::Fatal(PageError::Malformed(msg))
    }
}
