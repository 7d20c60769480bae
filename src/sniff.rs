use crate::error::ProxyError;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout_at, Instant};

/// Ceiling for plaintext header sniffing.
const HTTP_SNIFF_LIMIT: usize = 8 * 1024;

/// A TLS record payload may not exceed 16 KiB.
const TLS_RECORD_LIMIT: usize = 16 * 1024;

const TLS_HEADER_LEN: usize = 5;

/// Whole-sniff deadline per connection.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between peeks when the client has sent nothing new.
const PEEK_RETRY: Duration = Duration::from_millis(10);

/// Window inspected to reject non-HTTP bytes before a full line arrives.
const METHOD_PROBE: usize = 24;

/// Determines the hostname the client is asking for without consuming any
/// bytes: everything is read with `peek`, so the byte pump later forwards the
/// stream from the client's byte 0.
pub async fn sniff_domain(stream: &TcpStream, tls: bool) -> Result<String, ProxyError> {
    let deadline = Instant::now() + SNIFF_TIMEOUT;
    if tls {
        sniff_sni(stream, deadline).await
    } else {
        sniff_host(stream, deadline).await
    }
}

/// Plaintext mode: parse the request line and header lines out of the peeked
/// window until a Host header shows up.
async fn sniff_host(stream: &TcpStream, deadline: Instant) -> Result<String, ProxyError> {
    let mut buf = vec![0u8; HTTP_SNIFF_LIMIT];
    let mut seen = 0usize;

    loop {
        let n = peek(stream, &mut buf, deadline).await?;
        match parse_http_host(&buf[..n])? {
            Some(host) => return Ok(host),
            None if n == buf.len() => return Err(ProxyError::SniffOverflow),
            None => {
                if n == seen {
                    wait_for_more(deadline).await?;
                }
                seen = n;
            }
        }
    }
}

/// TLS mode: require a handshake record, peek the full record, walk the
/// ClientHello to its server_name extension.
async fn sniff_sni(stream: &TcpStream, deadline: Instant) -> Result<String, ProxyError> {
    let mut header = [0u8; TLS_HEADER_LEN];
    let mut seen = 0usize;
    loop {
        let n = peek(stream, &mut header, deadline).await?;
        if n >= TLS_HEADER_LEN {
            break;
        }
        if n == seen {
            wait_for_more(deadline).await?;
        }
        seen = n;
    }

    // content_type must be handshake, version major must be 3.
    if header[0] != 0x16 || header[1] != 0x03 {
        return Err(ProxyError::NotTls);
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 {
        return Err(ProxyError::NotTls);
    }
    if record_len > TLS_RECORD_LIMIT {
        return Err(ProxyError::SniffOverflow);
    }

    let total = TLS_HEADER_LEN + record_len;
    let mut buf = vec![0u8; total];
    let mut seen = 0usize;
    loop {
        let n = peek(stream, &mut buf, deadline).await?;
        if n >= total {
            break;
        }
        if n == seen {
            wait_for_more(deadline).await?;
        }
        seen = n;
    }

    parse_client_hello_sni(&buf[TLS_HEADER_LEN..total])
}

async fn peek(stream: &TcpStream, buf: &mut [u8], deadline: Instant) -> Result<usize, ProxyError> {
    match timeout_at(deadline, stream.peek(buf)).await {
        Ok(Ok(0)) => Err(ProxyError::SniffIo(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed before preamble",
        ))),
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(ProxyError::SniffIo(e)),
        Err(_) => Err(ProxyError::SniffTimeout),
    }
}

/// `peek` returns immediately while the kernel buffer is unchanged, so back
/// off briefly before looking again.
async fn wait_for_more(deadline: Instant) -> Result<(), ProxyError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(ProxyError::SniffTimeout);
    }
    sleep_until(deadline.min(now + PEEK_RETRY)).await;
    Ok(())
}

/// Pure pass over the peeked bytes. `Ok(Some(host))` when a Host header line
/// is complete, `Ok(None)` when more bytes are needed.
fn parse_http_host(buf: &[u8]) -> Result<Option<String>, ProxyError> {
    // Reject obviously non-HTTP bytes before a full line arrives.
    if !looks_like_method(&buf[..buf.len().min(METHOD_PROBE)]) {
        return Err(ProxyError::UnrecognizedProtocol);
    }

    let Some(line_end) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    if !valid_request_line(&buf[..line_end]) {
        return Err(ProxyError::UnrecognizedProtocol);
    }

    let mut pos = line_end + 2;
    loop {
        let Some(end) = find_crlf(buf, pos) else {
            return Ok(None);
        };
        if end == pos {
            // Empty line: headers finished without a Host.
            return Err(ProxyError::NoHost);
        }
        if let Some(value) = header_value(&buf[pos..end], "host") {
            let host = strip_port(value);
            if host.is_empty() {
                return Err(ProxyError::NoHost);
            }
            return Ok(Some(host.to_ascii_lowercase()));
        }
        pos = end + 2;
    }
}

fn looks_like_method(prefix: &[u8]) -> bool {
    for (i, &b) in prefix.iter().enumerate() {
        if b == b' ' {
            return i > 0;
        }
        if !b.is_ascii_alphabetic() {
            return false;
        }
    }
    true
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn valid_request_line(line: &[u8]) -> bool {
    let Ok(line) = std::str::from_utf8(line) else {
        return false;
    };
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    !method.is_empty()
        && method.bytes().all(|b| b.is_ascii_alphabetic())
        && !target.is_empty()
        && version.starts_with("HTTP/")
}

fn header_value<'a>(line: &'a [u8], name: &str) -> Option<&'a str> {
    let line = std::str::from_utf8(line).ok()?;
    let (key, value) = line.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

/// Drops an all-digit `:port` suffix; leaves anything else alone.
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

/// Walks a handshake record payload to the first server_name entry.
fn parse_client_hello_sni(payload: &[u8]) -> Result<String, ProxyError> {
    if payload.len() < 4 || payload[0] != 0x01 {
        return Err(ProxyError::NotTls);
    }
    let msg_len = ((payload[1] as usize) << 16) | ((payload[2] as usize) << 8) | payload[3] as usize;
    if 4 + msg_len > payload.len() {
        // ClientHello continues in the next record; we do not reassemble.
        return Err(ProxyError::TlsFragmented);
    }

    walk_client_hello(&payload[4..4 + msg_len]).ok_or(ProxyError::NoSni)
}

fn walk_client_hello(body: &[u8]) -> Option<String> {
    // client_version(2) + random(32)
    let mut off = 34usize;

    let session_len = *body.get(off)? as usize;
    off += 1 + session_len;

    let suites_len = be16(body, off)?;
    off += 2 + suites_len;

    let compression_len = *body.get(off)? as usize;
    off += 1 + compression_len;

    let ext_total = be16(body, off)?;
    off += 2;
    let end = off.checked_add(ext_total)?;
    if end > body.len() {
        return None;
    }

    while off + 4 <= end {
        let ext_type = be16(body, off)?;
        let ext_len = be16(body, off + 2)?;
        off += 4;
        if off + ext_len > end {
            return None;
        }
        if ext_type == 0x0000 {
            return parse_server_name(&body[off..off + ext_len]);
        }
        off += ext_len;
    }

    None
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let list_len = be16(data, 0)?;
    let mut off = 2usize;
    let end = (2 + list_len).min(data.len());

    while off + 3 <= end {
        let name_type = data[off];
        let name_len = be16(data, off + 1)?;
        off += 3;
        if off + name_len > end {
            return None;
        }
        if name_type == 0x00 {
            let name = std::str::from_utf8(&data[off..off + name_len]).ok()?;
            return Some(name.to_ascii_lowercase());
        }
        off += name_len;
    }

    None
}

fn be16(buf: &[u8], at: usize) -> Option<usize> {
    let hi = *buf.get(at)? as usize;
    let lo = *buf.get(at + 1)? as usize;
    Some((hi << 8) | lo)
}

#[cfg(test)]
pub(crate) mod testdata {
    /// Builds a complete handshake record (header + ClientHello) carrying one
    /// server_name entry.
    pub fn client_hello(sni: &str) -> Vec<u8> {
        let name = sni.as_bytes();

        let mut server_name = Vec::new();
        server_name.extend(((name.len() + 3) as u16).to_be_bytes());
        server_name.push(0x00); // host_name
        server_name.extend((name.len() as u16).to_be_bytes());
        server_name.extend(name);

        let mut extensions = Vec::new();
        // A non-SNI extension first, so the walker has to skip one.
        extensions.extend(0x000au16.to_be_bytes()); // supported_groups
        extensions.extend(4u16.to_be_bytes());
        extensions.extend([0x00, 0x02, 0x00, 0x17]);
        extensions.extend(0x0000u16.to_be_bytes()); // server_name
        extensions.extend((server_name.len() as u16).to_be_bytes());
        extensions.extend(server_name);

        let mut body = Vec::new();
        body.extend([0x03, 0x03]); // client_version
        body.extend([0u8; 32]); // random
        body.push(0); // session_id length
        body.extend(2u16.to_be_bytes()); // cipher_suites length
        body.extend([0x13, 0x01]);
        body.push(1); // compression_methods length
        body.push(0);
        body.extend((extensions.len() as u16).to_be_bytes());
        body.extend(extensions);

        let mut handshake = vec![0x01];
        handshake.extend(&(body.len() as u32).to_be_bytes()[1..]); // 24-bit length
        handshake.extend(body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend((handshake.len() as u16).to_be_bytes());
        record.extend(handshake);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_host_simple() {
        let buf = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n";
        assert_eq!(parse_http_host(buf).unwrap(), Some("a.test".to_string()));
    }

    #[test]
    fn test_parse_host_strips_port_and_case() {
        let buf = b"GET / HTTP/1.1\r\nAccept: */*\r\nHOST: A.Test:8080\r\n\r\n";
        assert_eq!(parse_http_host(buf).unwrap(), Some("a.test".to_string()));
    }

    #[test]
    fn test_parse_host_long_method() {
        let buf = b"PROPPATCH /calendar HTTP/1.1\r\nHost: dav.test\r\n\r\n";
        assert_eq!(parse_http_host(buf).unwrap(), Some("dav.test".to_string()));
    }

    #[test]
    fn test_parse_host_first_occurrence_wins() {
        let buf = b"GET / HTTP/1.1\r\nHost: first.test\r\nHost: second.test\r\n\r\n";
        assert_eq!(
            parse_http_host(buf).unwrap(),
            Some("first.test".to_string())
        );
    }

    #[test]
    fn test_parse_host_returns_before_header_end() {
        // Host line is complete even though the header block is not.
        let buf = b"GET / HTTP/1.1\r\nHost: a.test\r\nX-Partial: yes";
        assert_eq!(parse_http_host(buf).unwrap(), Some("a.test".to_string()));
    }

    #[test]
    fn test_parse_host_missing_is_no_host() {
        let buf = b"GET / HTTP/1.0\r\n\r\n";
        assert!(matches!(parse_http_host(buf), Err(ProxyError::NoHost)));
    }

    #[test]
    fn test_parse_host_partial_needs_more() {
        assert_eq!(parse_http_host(b"GET / HT").unwrap(), None);
        assert_eq!(parse_http_host(b"GET / HTTP/1.1\r\nHos").unwrap(), None);
    }

    #[test]
    fn test_parse_host_rejects_bad_request_line() {
        assert!(matches!(
            parse_http_host(b"GARBAGE\r\n\r\n"),
            Err(ProxyError::UnrecognizedProtocol)
        ));
        assert!(matches!(
            parse_http_host(b"GET /\r\n"),
            Err(ProxyError::UnrecognizedProtocol)
        ));
    }

    #[test]
    fn test_parse_host_rejects_binary_early() {
        // A TLS record on a plaintext listener fails before any CRLF shows up.
        let buf = [0x16, 0x03, 0x01, 0x00, 0x20];
        assert!(matches!(
            parse_http_host(&buf),
            Err(ProxyError::UnrecognizedProtocol)
        ));
    }

    #[test]
    fn test_ipv6_host_untouched() {
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("a.test"), "a.test");
        assert_eq!(strip_port("a.test:80"), "a.test");
    }

    #[test]
    fn test_client_hello_sni_extracted() {
        let record = testdata::client_hello("S.Test");
        let sni = parse_client_hello_sni(&record[TLS_HEADER_LEN..]).unwrap();
        assert_eq!(sni, "s.test");
    }

    #[test]
    fn test_client_hello_without_sni() {
        // Strip the server_name extension by truncating the extension block
        // to just the first (non-SNI) extension.
        let mut record = testdata::client_hello("s.test");
        let payload = record[TLS_HEADER_LEN..].to_vec();
        // Rebuild with zero-length extension block instead.
        let mut body = payload[4..4 + 34].to_vec(); // version + random
        body.push(0); // session_id
        body.extend(2u16.to_be_bytes());
        body.extend([0x13, 0x01]);
        body.push(1);
        body.push(0);
        body.extend(0u16.to_be_bytes()); // empty extensions
        let mut handshake = vec![0x01];
        handshake.extend(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend(body);
        record = vec![0x16, 0x03, 0x01];
        record.extend((handshake.len() as u16).to_be_bytes());
        record.extend(handshake);

        assert!(matches!(
            parse_client_hello_sni(&record[TLS_HEADER_LEN..]),
            Err(ProxyError::NoSni)
        ));
    }

    #[test]
    fn test_client_hello_fragmented() {
        let record = testdata::client_hello("s.test");
        // Claim a handshake longer than this record carries.
        let mut payload = record[TLS_HEADER_LEN..].to_vec();
        payload[1] = 0xff;
        assert!(matches!(
            parse_client_hello_sni(&payload),
            Err(ProxyError::TlsFragmented)
        ));
    }

    #[test]
    fn test_non_handshake_payload() {
        assert!(matches!(
            parse_client_hello_sni(&[0x02, 0x00, 0x00, 0x00]),
            Err(ProxyError::NotTls)
        ));
    }

    #[tokio::test]
    async fn test_sniff_host_does_not_consume() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let payload = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\nHELLO".to_vec();
        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(&payload).await.unwrap();
            stream
        });

        let (stream, _) = listener.accept().await.unwrap();
        let domain = sniff_domain(&stream, false).await.unwrap();
        assert_eq!(domain, "a.test");

        // Everything the client sent is still readable.
        let _client = client.await.unwrap();
        let mut stream = stream;
        let mut read = vec![0u8; 64];
        let n = stream.read(&mut read).await.unwrap();
        assert_eq!(&read[..n], b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\nHELLO");
    }

    #[tokio::test]
    async fn test_sniff_sni_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let record = testdata::client_hello("s.test");
        let sent = record.clone();
        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(&sent).await.unwrap();
            stream
        });

        let (stream, _) = listener.accept().await.unwrap();
        let domain = sniff_domain(&stream, true).await.unwrap();
        assert_eq!(domain, "s.test");
        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn test_sniff_overflows_when_host_is_past_the_window() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut request = b"GET / HTTP/1.1\r\n".to_vec();
            request.extend(b"X-Padding: ");
            request.extend(std::iter::repeat_n(b'a', HTTP_SNIFF_LIMIT));
            request.extend(b"\r\nHost: late.test\r\n\r\n");
            stream.write_all(&request).await.unwrap();
            stream
        });

        let (stream, _) = listener.accept().await.unwrap();
        let err = sniff_domain(&stream, false).await.unwrap_err();
        assert!(matches!(err, ProxyError::SniffOverflow));
        let _ = client.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sniff_times_out_on_silent_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let err = sniff_domain(&stream, false).await.unwrap_err();
        assert!(matches!(err, ProxyError::SniffTimeout));
    }
}
