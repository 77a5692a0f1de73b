use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use QuiverPS::client::{RemotePageClient, StreamAck};
use QuiverPS::config::{ClientConfig, ServerConfig};
use QuiverPS::server::{HttpServer, PageService};
use QuiverPS::{metrics, PageError, PageKey, WalRecord};

const PS: usize = 1024;

// a port nothing listens on
fn dead_address() -> Result<String> {
    let l = TcpListener::bind("127.0.0.1:0")?;
    let addr = l.local_addr()?;
    drop(l);
    Ok(addr.to_string())
}

// Answers the first Ping, then accepts every further request and never replies.
fn hanging_service() -> Result<String> {
    let l = TcpListener::bind("127.0.0.1:0")?;
    let addr = l.local_addr()?.to_string();
    let answered = Arc::new(AtomicBool::new(false));
    thread::spawn(move || {
        for stream in l.incoming().flatten() {
            let answered = answered.clone();
            thread::spawn(move || serve_once_then_hang(stream, &answered));
        }
    });
    Ok(addr)
}

fn serve_once_then_hang(stream: TcpStream, answered: &AtomicBool) {
    let Ok(mut w) = stream.try_clone() else { return };
    let mut r = BufReader::new(stream);
    loop {
        // request head; Ping carries no body
        let mut line = String::new();
        loop {
            line.clear();
            match r.read_line(&mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) if line == "\r\n" => break,
                Ok(_) => {}
            }
        }
        if answered.swap(true, Ordering::SeqCst) {
            // hold the socket open without replying
            thread::sleep(Duration::from_secs(60));
            return;
        }
        let body = r#"{"status":"ok","version":"1.0.0","last_applied_lsn":0}"#;
        let resp = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        if w.write_all(resp.as_bytes()).is_err() {
            return;
        }
    }
}

fn empty_record(lsn: u64) -> Vec<u8> {
    WalRecord::new(lsn, Vec::new())
        .encode_payload()
        .expect("encode")
}

#[test]
fn unreachable_at_init_disables_the_client() -> Result<()> {
    let cfg = ClientConfig::for_address(dead_address()?)
        .with_page_size(PS)
        .with_connect_timeout_ms(200)
        .with_max_retries(1)
        .with_backoff_ms(10, 20);

    let started = Instant::now();
    let client = RemotePageClient::init(cfg);
    assert!(!client.is_enabled());
    assert!(started.elapsed() < Duration::from_secs(5));

    let t = Instant::now();
    assert_eq!(client.stream_wal(1, &empty_record(1))?, StreamAck::Skipped);
    assert_eq!(
        client.get_page(PageKey::new(1, 1), 1),
        Err(PageError::Disabled)
    );
    assert!(t.elapsed() < Duration::from_millis(100), "disabled client must not do I/O");
    Ok(())
}

#[test]
fn stream_wal_degrades_when_service_goes_away() -> Result<()> {
    let svc = PageService::start(
        ServerConfig::default()
            .with_page_size(PS)
            .with_compact_interval_ms(0),
    )?;
    let http = HttpServer::bind("127.0.0.1:0", svc.clone())?;
    let client = RemotePageClient::init(
        ClientConfig::for_address(http.local_addr().to_string())
            .with_page_size(PS)
            .with_connect_timeout_ms(200)
            .with_io_timeout_ms(300)
            .with_backoff_ms(20, 50)
            .with_request_deadline_ms(1000)
            .with_wal_deadline_ms(500),
    );
    assert!(client.is_enabled());
    assert!(client.stream_wal(1, &empty_record(1))?.is_acked());

    http.shutdown();
    drop(http);
    svc.shutdown();

    let degraded_before = metrics::snapshot().client_wal_degraded;
    let started = Instant::now();
    let ack = client.stream_wal(2, &empty_record(2))?;
    let took = started.elapsed();
    assert!(
        matches!(ack, StreamAck::Degraded { .. }),
        "expected Degraded, got {:?}",
        ack
    );
    assert!(took < Duration::from_secs(3), "stream_wal blocked for {:?}", took);
    assert!(metrics::snapshot().client_wal_degraded > degraded_before);

    // GetPage has no degraded mode: the caller decides
    let started = Instant::now();
    let err = client.get_page(PageKey::new(1, 1), 1).unwrap_err();
    assert!(matches!(err, PageError::Unavailable(_)), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(4));
    Ok(())
}

#[test]
fn shutdown_disables_and_skips() -> Result<()> {
    let svc = PageService::start(
        ServerConfig::default()
            .with_page_size(PS)
            .with_compact_interval_ms(0),
    )?;
    let http = HttpServer::bind("127.0.0.1:0", svc.clone())?;
    let client = RemotePageClient::init(
        ClientConfig::for_address(http.local_addr().to_string()).with_page_size(PS),
    );
    assert!(client.is_enabled());
    assert!(client.ping().is_ok());

    client.shutdown();
    assert!(!client.is_enabled());
    assert_eq!(client.stream_wal(5, &empty_record(5))?, StreamAck::Skipped);
    assert_eq!(client.ping().unwrap_err(), PageError::Disabled);

    http.shutdown();
    svc.shutdown();
    Ok(())
}

#[test]
fn wrong_page_size_is_malformed_not_truncated() -> Result<()> {
    let svc = PageService::start(
        ServerConfig::default()
            .with_page_size(PS)
            .with_compact_interval_ms(0)
            .with_get_page_wait_ms(2000),
    )?;
    let http = HttpServer::bind("127.0.0.1:0", svc.clone())?;
    let key = PageKey::new(1, 1);
    svc.stream_wal(7, &[1u8; 8], Some(key))?;

    // client expects twice the server's page size
    let client = RemotePageClient::init(
        ClientConfig::for_address(http.local_addr().to_string()).with_page_size(PS * 2),
    );
    let err = client.get_page(key, 7).unwrap_err();
    assert!(matches!(err, PageError::Malformed(_)), "got {:?}", err);

    http.shutdown();
    svc.shutdown();
    Ok(())
}

#[test]
fn stream_wal_is_not_held_up_by_a_stuck_get_page() -> Result<()> {
    let addr = hanging_service()?;
    let client = Arc::new(RemotePageClient::init(
        ClientConfig::for_address(addr)
            .with_page_size(PS)
            .with_io_timeout_ms(2500)
            .with_request_deadline_ms(3000)
            .with_wal_deadline_ms(500),
    ));
    assert!(client.is_enabled(), "startup ping must succeed");

    let reader = client.clone();
    let stuck = thread::spawn(move || {
        let t = Instant::now();
        (reader.get_page(PageKey::new(1, 1), 1), t.elapsed())
    });
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    let ack = client.stream_wal(1, &empty_record(1))?;
    let took = started.elapsed();
    assert!(
        matches!(ack, StreamAck::Degraded { .. }),
        "expected Degraded, got {:?}",
        ack
    );
    assert!(took < Duration::from_millis(1500), "stream_wal waited {:?}", took);

    // the stuck reader still gives up at its own deadline
    let (res, reader_took) = stuck.join().expect("reader thread");
    assert!(matches!(res, Err(PageError::Unavailable(_))), "got {:?}", res);
    assert!(reader_took < Duration::from_millis(3700), "get_page took {:?}", reader_took);
    Ok(())
}

#[test]
fn get_page_on_hung_socket_respects_overall_deadline() -> Result<()> {
    let addr = hanging_service()?;
    // io timeout alone would allow two full waits (reused socket + fresh reconnect)
    let client = RemotePageClient::init(
        ClientConfig::for_address(addr)
            .with_page_size(PS)
            .with_max_retries(0)
            .with_io_timeout_ms(1000)
            .with_request_deadline_ms(1200),
    );
    assert!(client.is_enabled());

    let started = Instant::now();
    let err = client.get_page(PageKey::new(1, 1), 1).unwrap_err();
    let took = started.elapsed();
    assert!(matches!(err, PageError::Unavailable(_)), "got {:?}", err);
    assert!(took < Duration::from_millis(1700), "get_page took {:?}", took);
    Ok(())
}
