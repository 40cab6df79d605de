//! Blocking GETFILE client, used by tests and for manual checks.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::gfserver::find_terminator;
use crate::protocol::{parse_response, request_header, timeouts, GfStatus, HEADER_END};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GfResponse {
    pub status: GfStatus,
    pub body: Vec<u8>,
}

/// Request `path` and read the whole response body.
pub fn fetch<A: ToSocketAddrs>(addr: A, path: &str) -> Result<GfResponse> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs().context("resolve address")?.collect();
    let mut last_err = None;
    let mut stream = None;
    for a in addrs {
        match TcpStream::connect_timeout(&a, Duration::from_millis(timeouts::CONNECT_MS)) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let mut stream = match (stream, last_err) {
        (Some(s), _) => s,
        (None, Some(e)) => return Err(e).context("connect"),
        (None, None) => bail!("address resolved to nothing"),
    };

    stream
        .write_all(request_header(path).as_bytes())
        .context("send request")?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(end) = find_terminator(&buf) {
            break end + HEADER_END.len();
        }
        let n = stream.read(&mut chunk).context("read response header")?;
        if n == 0 {
            bail!("connection closed before response header");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header = std::str::from_utf8(&buf[..header_end]).context("response header not UTF-8")?;
    let (status, len) =
        parse_response(header).with_context(|| format!("bad response header {:?}", header))?;

    let mut body = buf[header_end..].to_vec();
    if status == GfStatus::Ok {
        let len = usize::try_from(len).context("response too large")?;
        while body.len() < len {
            let n = stream.read(&mut chunk).context("read response body")?;
            if n == 0 {
                bail!("connection closed after {} of {} bytes", body.len(), len);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(len);
    } else {
        body.clear();
    }
    Ok(GfResponse { status, body })
}
