use std::net::SocketAddr;

/// Formats the PROXY protocol v1 line announcing the original client
/// addressing to a PROXY-aware upstream.
///
/// `dst` is the listen address as the client saw it, not the upstream. The
/// line is at most 107 bytes including the trailing CRLF.
pub fn proxy_v1_line(src: SocketAddr, dst: SocketAddr) -> String {
    let family = if src.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    )
}
