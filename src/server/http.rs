//! server/http — HTTP/JSON фронтенд PageService на tiny_http.
//!
//! Воркеры (http_workers) делят один tiny_http::Server и крутят recv_timeout, проверяя флаг
//! остановки. Маршрутизация вынесена в route(), чтобы её можно было гонять без сокетов.
//!
//! Коды ответов: success/ok 200, not_found 404, not_applied 503, error 400 (503, если сервис
//! временно не может принять запрос, например переполнена очередь applier'а).
//! Известный путь с чужим методом — 405, неизвестный путь — 404.

use std::fmt::Display;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::Serialize;
use tiny_http::{Header, Request, Response, Server};

use crate::consts::{
    MAX_REQUEST_BYTES, PATH_GET_PAGE, PATH_GET_PAGES, PATH_HEALTH, PATH_METRICS, PATH_PING,
    PATH_STREAM_WAL,
};
use crate::error::PageError;
use crate::metrics;
use crate::page::PageVersion;
use crate::proto::{
    decode_payload, ErrorResponse, GetPageRequest, GetPageResponse, GetPagesRequest,
    GetPagesResponse, PingResponse, Status, StreamWalRequest, StreamWalResponse,
};

use super::PageService;

const CT_JSON: &str = "application/json";
const CT_TEXT: &str = "text/plain; version=0.0.4";

const RECV_POLL: Duration = Duration::from_millis(100);

/// A routed response, before it hits the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    fn json<T: Serialize>(code: u16, body: &T) -> Self {
        let body = serde_json::to_string(body).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","error":"encode response: {}"}}"#, e)
        });
        Self {
            code,
            content_type: CT_JSON,
            body,
        }
    }

    fn text(code: u16, body: String) -> Self {
        Self {
            code,
            content_type: CT_TEXT,
            body,
        }
    }

    fn error(code: u16, msg: impl Into<String>) -> Self {
        Self::json(code, &ErrorResponse::new(msg))
    }
}

/// Dispatch one request against the service.
pub fn route(svc: &PageService, method: &str, path: &str, body: &[u8]) -> Reply {
    let expected = match path {
        PATH_GET_PAGE | PATH_GET_PAGES | PATH_STREAM_WAL => "POST",
        PATH_PING | PATH_METRICS | PATH_HEALTH => "GET",
        _ => return Reply::error(404, format!("no route for {}", path)),
    };
    if method != expected {
        return Reply::error(
            405,
            format!("{} requires {}, got {}", path, expected, method),
        );
    }

    match path {
        PATH_GET_PAGE => handle_get_page(svc, body),
        PATH_GET_PAGES => handle_get_pages(svc, body),
        PATH_STREAM_WAL => handle_stream_wal(svc, body),
        PATH_PING => {
            let info = svc.ping();
            Reply::json(
                200,
                &PingResponse {
                    status: Status::Ok,
                    version: info.version.to_string(),
                    last_applied_lsn: info.last_applied_lsn,
                },
            )
        }
        PATH_METRICS => Reply::text(200, render_metrics(svc)),
        _ => Reply::text(200, "OK\n".to_string()),
    }
}

fn page_reply(res: crate::error::Result<PageVersion>) -> GetPageResponse {
    match res {
        Ok(v) => GetPageResponse::success(&v.data, v.lsn),
        Err(e) if e.is_not_found() => GetPageResponse::not_found(),
        Err(PageError::NotApplied { applied, .. }) => GetPageResponse::not_applied(applied),
        Err(e) => GetPageResponse::error(e.to_string()),
    }
}

fn error_code(e: &PageError) -> u16 {
    match e {
        PageError::Unavailable(_) => 503,
        _ => 400,
    }
}

fn handle_get_page(svc: &PageService, body: &[u8]) -> Reply {
    let req: GetPageRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return Reply::json(400, &GetPageResponse::error(format!("bad request: {}", e)))
        }
    };
    let res = svc.get_page(req.key(), req.lsn);
    let unavailable = matches!(res, Err(PageError::Unavailable(_)));
    let resp = page_reply(res);
    let code = if unavailable { 503 } else { resp.status.http_code() };
    Reply::json(code, &resp)
}

fn handle_get_pages(svc: &PageService, body: &[u8]) -> Reply {
    let req: GetPagesRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return Reply::error(400, format!("bad request: {}", e)),
    };
    let keys: Vec<_> = req.pages.iter().map(|p| (p.key(), p.lsn)).collect();
    let results = svc.get_pages(&keys).into_iter().map(page_reply).collect();
    Reply::json(
        200,
        &GetPagesResponse {
            status: Status::Success,
            results,
        },
    )
}

fn handle_stream_wal(svc: &PageService, body: &[u8]) -> Reply {
    let failed = |e: &PageError| {
        Reply::json(
            error_code(e),
            &StreamWalResponse {
                status: Status::Error,
                last_applied_lsn: svc.last_applied_lsn(),
                error: Some(e.to_string()),
            },
        )
    };

    let req: StreamWalRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return failed(&PageError::malformed(format!("request: {}", e))),
    };
    let payload = match decode_payload(&req.wal_data) {
        Ok(p) => p,
        Err(e) => {
            metrics::record_wal_malformed();
            return failed(&e);
        }
    };
    match svc.stream_wal(req.lsn, &payload, req.legacy_key()) {
        Ok(wm) => Reply::json(
            200,
            &StreamWalResponse {
                status: Status::Success,
                last_applied_lsn: wm,
                error: None,
            },
        ),
        Err(e) => failed(&e),
    }
}

fn push_metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl Display) {
    out.push_str(&format!("# HELP quiverps_{} {}\n", name, help));
    out.push_str(&format!("# TYPE quiverps_{} {}\n", name, kind));
    out.push_str(&format!("quiverps_{} {}\n", name, value));
}

/// Prometheus text exposition of the process counters and service gauges.
pub fn render_metrics(svc: &PageService) -> String {
    let m = metrics::snapshot();
    let st = svc.index_stats();
    let mut out = String::new();

    let ver = env!("CARGO_PKG_VERSION");
    out.push_str("# HELP quiverps_build_info Build info.\n");
    out.push_str("# TYPE quiverps_build_info gauge\n");
    out.push_str(&format!("quiverps_build_info{{version=\"{}\"}} 1\n", ver));

    // --- Page service ---
    push_metric(&mut out, "get_page_requests_total", "counter", "GetPage requests.", m.get_page_requests);
    push_metric(&mut out, "get_page_not_found_total", "counter", "GetPage answered not_found.", m.get_page_not_found);
    push_metric(&mut out, "get_page_not_applied_total", "counter", "GetPage answered not_applied.", m.get_page_not_applied);
    push_metric(&mut out, "get_page_waits_total", "counter", "GetPage requests that waited for the watermark.", m.get_page_waits);
    push_metric(&mut out, "get_page_wait_ratio", "gauge", "Share of GetPage requests that waited (percent).", format!("{:.2}", m.get_page_wait_ratio() * 100.0));
    push_metric(&mut out, "ping_requests_total", "counter", "Ping requests.", m.ping_requests);

    // --- WAL ---
    push_metric(&mut out, "wal_records_received_total", "counter", "StreamWAL records received.", m.wal_records_received);
    push_metric(&mut out, "wal_bytes_received_total", "counter", "StreamWAL payload bytes received.", m.wal_bytes_received);
    push_metric(&mut out, "wal_records_malformed_total", "counter", "Records rejected as malformed.", m.wal_records_malformed);
    push_metric(&mut out, "wal_records_rejected_total", "counter", "Records rejected by backpressure.", m.wal_records_rejected);
    push_metric(&mut out, "wal_records_applied_total", "counter", "Records applied.", m.wal_records_applied);
    push_metric(&mut out, "wal_pages_written_total", "counter", "Page versions written by the applier.", m.wal_pages_written);
    push_metric(&mut out, "wal_stale_discards_total", "counter", "Duplicate or late page writes discarded.", m.wal_stale_discards);
    push_metric(&mut out, "applied_lsn", "gauge", "Applied watermark.", svc.last_applied_lsn());
    push_metric(&mut out, "wal_pending_records", "gauge", "Records accepted but not yet under the watermark.", svc.pending_records());

    // --- Index ---
    push_metric(&mut out, "index_keys", "gauge", "Pages with at least one version.", st.keys);
    push_metric(&mut out, "index_versions", "gauge", "Stored page versions.", st.versions);
    push_metric(&mut out, "index_bytes", "gauge", "Bytes held by stored versions.", st.bytes);
    push_metric(&mut out, "active_readers", "gauge", "GetPage reads in flight.", svc.active_readers());

    // --- Compaction ---
    push_metric(&mut out, "compaction_runs_total", "counter", "Compaction passes.", m.compaction_runs);
    push_metric(&mut out, "versions_compacted_total", "counter", "Versions dropped by compaction.", m.versions_compacted);

    out
}

fn respond(rq: Request, reply: Reply) {
    let mut resp = Response::from_string(reply.body).with_status_code(reply.code);
    if let Ok(ct) = Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes()) {
        resp.add_header(ct);
    }
    if let Err(e) = rq.respond(resp) {
        debug!("http respond error: {}", e);
    }
}

fn handle_request(svc: &PageService, mut rq: Request) {
    let method = rq.method().as_str().to_string();
    let url = rq.url().to_string();
    let path = url.split('?').next().unwrap_or_default().to_string();

    if rq.body_length().map_or(false, |n| n > MAX_REQUEST_BYTES) {
        respond(rq, Reply::error(413, "request body too large"));
        return;
    }
    let mut body = Vec::new();
    if let Err(e) = rq
        .as_reader()
        .take(MAX_REQUEST_BYTES as u64 + 1)
        .read_to_end(&mut body)
    {
        warn!("http {} {}: read body: {}", method, path, e);
        respond(rq, Reply::error(400, format!("read body: {}", e)));
        return;
    }
    if body.len() > MAX_REQUEST_BYTES {
        respond(rq, Reply::error(413, "request body too large"));
        return;
    }

    let reply = route(svc, &method, &path, &body);
    debug!("http {} {} -> {}", method, path, reply.code);
    respond(rq, reply);
}

/// tiny_http listener plus its worker threads.
pub struct HttpServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpServer {
    /// Bind `service.config().listen` and start `http_workers` threads.
    pub fn start(service: Arc<PageService>) -> Result<Self> {
        let listen = service.config().listen.clone();
        Self::bind(&listen, service)
    }

    /// Bind an explicit address (`127.0.0.1:0` picks a free port).
    pub fn bind(listen: &str, service: Arc<PageService>) -> Result<Self> {
        let server = Server::http(listen).map_err(|e| anyhow!("bind http at {}: {}", listen, e))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("listener at {} is not a TCP socket", listen))?;
        let server = Arc::new(server);
        let stop = Arc::new(AtomicBool::new(false));

        let n = service.config().http_workers.max(1);
        let mut workers = Vec::with_capacity(n);
        for i in 0..n {
            let server = server.clone();
            let stop = stop.clone();
            let svc = service.clone();
            let h = thread::Builder::new()
                .name(format!("qps-http-{}", i))
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        match server.recv_timeout(RECV_POLL) {
                            Ok(Some(rq)) => handle_request(&svc, rq),
                            Ok(None) => {}
                            Err(e) => warn!("http recv error: {}", e),
                        }
                    }
                })
                .map_err(|e| anyhow!("spawn http worker: {}", e))?;
            workers.push(h);
        }

        info!("page service listening on http://{} ({} workers)", addr, n);
        Ok(Self {
            addr,
            stop,
            workers: Mutex::new(workers),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until the workers exit.
    pub fn wait(&self) {
        let workers = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => return,
        };
        for h in workers {
            let _ = h.join();
        }
    }

    /// Stop accepting requests and join the workers. The listener closes with the last worker.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.wait();
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
