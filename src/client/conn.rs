//! client/conn — одно keep-alive HTTP/1.1 соединение поверх TcpStream.
//!
//! Запрос за запросом, строго по одному в полёте: ответ читается целиком (Content-Length или
//! chunked) до отправки следующего запроса, поэтому фрейминг однозначен.
//! `Connection: close` от сервера или ответ без длины помечают соединение как непригодное
//! для повторного использования.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::consts::{DEFAULT_PORT, MAX_RESPONSE_BYTES};
use crate::error::{PageError, Result};

/// Service address split into host and port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Accepts `host`, `host:port`, `[v6]:port`, optionally prefixed with `http://`.
    pub fn parse(addr: &str) -> Result<Self> {
        let s = addr.trim();
        let s = s.strip_prefix("http://").unwrap_or(s);
        let s = s.trim_end_matches('/');
        if s.is_empty() {
            return Err(PageError::malformed("empty service address"));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| PageError::malformed(format!("bad address '{}'", addr)))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, addr)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(PageError::malformed(format!("bad address '{}'", addr))),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        match s.rsplit_once(':') {
            Some((host, p)) if !host.contains(':') => Ok(Self {
                host: host.to_string(),
                port: parse_port(p, addr)?,
            }),
            // no port, or a bare IPv6 literal
            _ => Ok(Self {
                host: s.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }

    /// Value for the Host header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }
}

fn parse_port(p: &str, addr: &str) -> Result<u16> {
    p.parse::<u16>()
        .map_err(|_| PageError::malformed(format!("bad port in address '{}'", addr)))
}

/// A fully read response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Server asked to close, or the body was delimited by EOF.
    pub close: bool,
}

pub struct HttpConn {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    authority: String,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl HttpConn {
    /// Connect to the first resolvable address that accepts within `connect_timeout`.
    pub fn connect(ep: &Endpoint, connect_timeout: Duration, io_timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;
        for sa in ep.resolve()? {
            match TcpStream::connect_timeout(&sa, connect_timeout) {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    let reader = BufReader::new(tcp.try_clone()?);
                    let conn = Self {
                        writer: tcp,
                        reader,
                        authority: ep.authority(),
                    };
                    conn.set_io_timeout(io_timeout)?;
                    return Ok(conn);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}", ep.authority()),
            )
        }))
    }

    pub fn set_io_timeout(&self, t: Duration) -> io::Result<()> {
        let t = t.max(Duration::from_millis(1));
        self.writer.set_read_timeout(Some(t))?;
        self.writer.set_write_timeout(Some(t))
    }

    /// Send one request and read the whole response.
    pub fn request(&mut self, method: &str, path: &str, body: Option<&[u8]>) -> io::Result<HttpResponse> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: quiverps/{}\r\nAccept: application/json\r\nConnection: keep-alive\r\n",
            method,
            path,
            self.authority,
            env!("CARGO_PKG_VERSION")
        );
        if let Some(b) = body {
            head.push_str("Content-Type: application/json\r\n");
            head.push_str(&format!("Content-Length: {}\r\n", b.len()));
        }
        head.push_str("\r\n");

        self.writer.write_all(head.as_bytes())?;
        if let Some(b) = body {
            self.writer.write_all(b)?;
        }
        self.writer.flush()?;

        self.read_response()
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_response(&mut self) -> io::Result<HttpResponse> {
        loop {
            let status_line = self.read_line()?;
            let mut parts = status_line.splitn(3, ' ');
            let version = parts.next().unwrap_or_default();
            if !version.starts_with("HTTP/1.") {
                return Err(invalid(format!("bad status line '{}'", status_line)));
            }
            let status: u16 = parts
                .next()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| invalid(format!("bad status line '{}'", status_line)))?;

            let mut content_length: Option<usize> = None;
            let mut chunked = false;
            let mut close = version == "HTTP/1.0";
            loop {
                let line = self.read_line()?;
                if line.is_empty() {
                    break;
                }
                let Some((name, value)) = line.split_once(':') else {
                    return Err(invalid(format!("bad header line '{}'", line)));
                };
                let value = value.trim();
                match name.trim().to_ascii_lowercase().as_str() {
                    "content-length" => {
                        content_length = Some(
                            value
                                .parse()
                                .map_err(|_| invalid(format!("bad Content-Length '{}'", value)))?,
                        )
                    }
                    "transfer-encoding" => {
                        chunked = value.to_ascii_lowercase().contains("chunked");
                    }
                    "connection" => {
                        let v = value.to_ascii_lowercase();
                        if v.contains("close") {
                            close = true;
                        } else if v.contains("keep-alive") {
                            close = false;
                        }
                    }
                    _ => {}
                }
            }

            // 1xx: informational, the real response follows
            if (100..200).contains(&status) {
                continue;
            }

            let body = if chunked {
                self.read_chunked()?
            } else if let Some(n) = content_length {
                if n > MAX_RESPONSE_BYTES {
                    return Err(invalid(format!("response body too large: {} bytes", n)));
                }
                let mut buf = vec![0u8; n];
                self.reader.read_exact(&mut buf)?;
                buf
            } else if status == 204 || status == 304 {
                Vec::new()
            } else {
                close = true;
                let mut buf = Vec::new();
                (&mut self.reader)
                    .take(MAX_RESPONSE_BYTES as u64 + 1)
                    .read_to_end(&mut buf)?;
                if buf.len() > MAX_RESPONSE_BYTES {
                    return Err(invalid("response body too large"));
                }
                buf
            };

            return Ok(HttpResponse {
                status,
                body,
                close,
            });
        }
    }

    fn read_chunked(&mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line()?;
            let size_str = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| invalid(format!("bad chunk size '{}'", line)))?;
            if size == 0 {
                // trailers up to the empty line
                while !self.read_line()?.is_empty() {}
                return Ok(body);
            }
            if body.len() + size > MAX_RESPONSE_BYTES {
                return Err(invalid("response body too large"));
            }
            let start = body.len();
            body.resize(start + size, 0);
            self.reader.read_exact(&mut body[start..])?;
            let mut crlf = [0u8; 2];
            self.reader.read_exact(&mut crlf)?;
            if &crlf != b"\r\n" {
                return Err(invalid("chunk not terminated by CRLF"));
            }
        }
    }
}
