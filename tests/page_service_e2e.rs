use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use QuiverPS::client::{PageRequest, RemotePageClient, StreamAck};
use QuiverPS::config::{ClientConfig, ServerConfig};
use QuiverPS::server::{HttpServer, PageService};
use QuiverPS::{PageError, PageKey, PageOp, WalRecord};

const PS: usize = 4096;

struct Harness {
    svc: Arc<PageService>,
    http: HttpServer,
    client: RemotePageClient,
}

impl Harness {
    fn start() -> Result<Self> {
        let svc = PageService::start(
            ServerConfig::default()
                .with_page_size(PS)
                .with_http_workers(4)
                .with_get_page_wait_ms(2000)
                .with_compact_interval_ms(0),
        )?;
        let http = HttpServer::bind("127.0.0.1:0", svc.clone())?;
        let client = connect_client(&http);
        assert!(client.is_enabled(), "startup ping must succeed");
        Ok(Self { svc, http, client })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.client.shutdown();
        self.http.shutdown();
        self.svc.shutdown();
    }
}

fn connect_client(http: &HttpServer) -> RemotePageClient {
    RemotePageClient::init(
        ClientConfig::for_address(http.local_addr().to_string())
            .with_page_size(PS)
            .with_max_retries(5),
    )
}

fn write_rec(lsn: u64, key: PageKey, offset: u32, bytes: &[u8]) -> Vec<u8> {
    WalRecord::new(
        lsn,
        vec![PageOp::Write {
            key,
            offset,
            bytes: bytes.to_vec(),
        }],
    )
    .encode_payload()
    .expect("encode")
}

fn acked(ack: StreamAck) -> u64 {
    match ack {
        StreamAck::Acked { last_applied_lsn } => last_applied_lsn,
        other => panic!("expected Acked, got {:?}", other),
    }
}

// bounded polling until the page at `lsn` is served
fn poll_page(c: &RemotePageClient, key: PageKey, lsn: u64) -> Result<QuiverPS::FetchedPage> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match c.get_page(key, lsn) {
            Ok(p) => return Ok(p),
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => return Err(e.into()),
        }
    }
}

#[test]
fn stream_wal_then_get_page_returns_applied_version() -> Result<()> {
    let h = Harness::start()?;
    let key = PageKey::new(1, 42);

    let wm = acked(h.client.stream_wal(1000, &write_rec(1000, key, 100, b"DATA"))?);
    assert!(wm <= 1000, "acknowledged watermark must be truthful");

    let page = poll_page(&h.client, key, 1000)?;
    assert_eq!(page.page_lsn, 1000);
    assert_eq!(page.data.len(), PS);
    assert_eq!(&page.data[100..104], b"DATA");
    assert!(page.data[..100].iter().all(|&b| b == 0));

    let ping = h.client.ping()?;
    assert!(ping.last_applied_lsn >= 1000);
    Ok(())
}

#[test]
fn page_lsn_is_the_stored_version_not_the_request() -> Result<()> {
    let h = Harness::start()?;
    let key = PageKey::new(7, 1);
    h.client.stream_wal(10, &write_rec(10, key, 0, b"a"))?;
    h.client.stream_wal(20, &write_rec(20, PageKey::new(7, 2), 0, b"b"))?;

    let page = poll_page(&h.client, key, 20)?;
    assert_eq!(page.page_lsn, 10);
    Ok(())
}

#[test]
fn unknown_key_is_not_found() -> Result<()> {
    let h = Harness::start()?;
    let unknown = PageKey::new(9, 9);
    assert_eq!(h.client.get_page(unknown, 0), Err(PageError::NotFound(unknown)));

    let other = PageKey::new(9, 10);
    h.client.stream_wal(50, &write_rec(50, other, 0, b"x"))?;
    poll_page(&h.client, other, 50)?;
    assert_eq!(h.client.get_page(unknown, 50), Err(PageError::NotFound(unknown)));
    Ok(())
}

#[test]
fn lsn_5_and_6_leave_latest_at_6_in_any_order() -> Result<()> {
    let h = Harness::start()?;
    let client = Arc::new(connect_client(&h.http));

    for (round, order) in ["5-then-6", "6-then-5", "concurrent"].iter().enumerate() {
        let key = PageKey::new(3, round as u32);
        let base = 100 * (round as u64 + 1);
        let (l5, l6) = (base + 5, base + 6);
        let r5 = write_rec(l5, key, 0, b"five");
        let r6 = write_rec(l6, key, 0, b"six!");

        match *order {
            "5-then-6" => {
                acked(client.stream_wal(l5, &r5)?);
                acked(client.stream_wal(l6, &r6)?);
            }
            "6-then-5" => {
                acked(client.stream_wal(l6, &r6)?);
                acked(client.stream_wal(l5, &r5)?);
            }
            _ => {
                let barrier = Arc::new(Barrier::new(2));
                let mut hs = Vec::new();
                for (lsn, rec) in [(l5, r5.clone()), (l6, r6.clone())] {
                    let c = client.clone();
                    let b = barrier.clone();
                    hs.push(thread::spawn(move || {
                        b.wait();
                        c.stream_wal(lsn, &rec)
                    }));
                }
                for t in hs {
                    acked(t.join().expect("thread")?);
                }
            }
        }

        let page = poll_page(&client, key, l6)?;
        assert_eq!(page.page_lsn, l6, "round {}", order);
        assert_eq!(&page.data[..4], b"six!", "round {}", order);
    }
    Ok(())
}

#[test]
fn duplicate_delivery_is_idempotent() -> Result<()> {
    let h = Harness::start()?;
    let key = PageKey::new(4, 4);
    let rec = write_rec(300, key, 8, b"once");

    acked(h.client.stream_wal(300, &rec)?);
    poll_page(&h.client, key, 300)?;
    let before = h.svc.index().version_lsns(key)?;

    acked(h.client.stream_wal(300, &rec)?);
    // a later record proves the duplicate went through the applier
    h.client.stream_wal(301, &write_rec(301, PageKey::new(4, 5), 0, b"z"))?;
    poll_page(&h.client, PageKey::new(4, 5), 301)?;

    assert_eq!(h.svc.index().version_lsns(key)?, before);
    assert_eq!(&poll_page(&h.client, key, 300)?.data[8..12], b"once");
    Ok(())
}

#[test]
fn batch_fetch_reports_each_page() -> Result<()> {
    let h = Harness::start()?;
    let a = PageKey::new(2, 1);
    let b = PageKey::new(2, 2);
    let rec = WalRecord::new(
        200,
        vec![
            PageOp::Image {
                key: a,
                data: vec![0xAA; PS],
            },
            PageOp::Image {
                key: b,
                data: vec![0xBB; 16],
            },
        ],
    );
    acked(h.client.stream_wal(200, &rec.encode_payload()?)?);
    poll_page(&h.client, a, 200)?;

    let res = h.client.get_pages_batch(&[
        PageRequest::new(2, 1, 200),
        PageRequest::new(2, 2, 200),
        PageRequest::new(2, 3, 200),
    ]);
    assert_eq!(res.len(), 3);
    assert!(res[0].as_ref().map(|p| p.data.iter().all(|&x| x == 0xAA)).unwrap_or(false));
    let pb = res[1].as_ref().expect("page b");
    assert_eq!(pb.page_lsn, 200);
    assert_eq!(&pb.data[..16], &[0xBB; 16]);
    assert!(pb.data[16..].iter().all(|&x| x == 0));
    assert_eq!(res[2], Err(PageError::NotFound(PageKey::new(2, 3))));
    Ok(())
}

#[test]
fn page_image_shorthand_and_malformed_payload() -> Result<()> {
    let h = Harness::start()?;
    let key = PageKey::new(5, 5);
    acked(h.client.stream_page_image(key, 400, &vec![0x11; PS])?);
    let page = poll_page(&h.client, key, 400)?;
    assert!(page.data.iter().all(|&b| b == 0x11));

    let err = h.client.stream_wal(401, b"definitely not a WAL record").unwrap_err();
    assert!(matches!(err, PageError::Malformed(_)), "got {:?}", err);
    assert_eq!(h.svc.pending_records(), 0);
    Ok(())
}
