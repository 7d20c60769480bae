use crate::error::ProxyError;
use crate::proxy::preamble::proxy_v1_line;
use crate::route::Target;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Per-endpoint connect deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The preamble is a single short line; it either goes out fast or the
/// upstream is broken.
const PREAMBLE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// A connected upstream, preamble already written when the target asked for
/// one.
#[derive(Debug)]
pub struct DialOutcome {
    pub stream: TcpStream,
    pub target_addr: SocketAddr,
}

/// Dials the target's primary endpoint, then each spare in declaration
/// order. Success is a completed TCP connect; no application probe is made.
///
/// `src`/`dst` are the client's address and the listen address it connected
/// to, used for the PROXY v1 preamble.
pub async fn dial(
    target: &Target,
    domain: &str,
    src: SocketAddr,
    dst: SocketAddr,
) -> Result<DialOutcome, ProxyError> {
    let mut last_err: Option<io::Error> = None;

    for &addr in std::iter::once(&target.primary).chain(target.spares.iter()) {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.set_nodelay(true);

                if target.proxy_version == 1 {
                    write_preamble(&mut stream, src, dst).await?;
                }

                return Ok(DialOutcome {
                    stream,
                    target_addr: addr,
                });
            }
            Ok(Err(e)) => {
                debug!(%domain, upstream = %addr, "Connect failed: {}", e);
                last_err = Some(e);
            }
            Err(_) => {
                debug!(%domain, upstream = %addr, "Connect timed out");
                last_err = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
        }
    }

    Err(ProxyError::NoUpstream {
        domain: domain.to_string(),
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no endpoints configured")),
    })
}

async fn write_preamble(
    stream: &mut TcpStream,
    src: SocketAddr,
    dst: SocketAddr,
) -> Result<(), ProxyError> {
    let line = proxy_v1_line(src, dst);
    match timeout(PREAMBLE_WRITE_TIMEOUT, stream.write_all(line.as_bytes())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ProxyError::UpstreamWriteFailure(e)),
        Err(_) => Err(ProxyError::UpstreamWriteFailure(io::Error::new(
            io::ErrorKind::TimedOut,
            "preamble write timed out",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn target(primary: SocketAddr, spares: Vec<SocketAddr>, version: u8) -> Target {
        Target {
            primary,
            spares,
            proxy_version: version,
        }
    }

    /// Binds then immediately drops a listener so the port is known-closed.
    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_dial_primary() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let outcome = dial(
            &target(addr, vec![], 0),
            "a.test",
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:18080".parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.target_addr, addr);
    }

    #[tokio::test]
    async fn test_dial_falls_back_to_spare() {
        let dead = closed_port().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let spare = listener.local_addr().unwrap();

        let outcome = dial(
            &target(dead, vec![spare], 0),
            "a.test",
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:18080".parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.target_addr, spare);
    }

    #[tokio::test]
    async fn test_dial_all_endpoints_down() {
        let dead1 = closed_port().await;
        let dead2 = closed_port().await;

        let err = dial(
            &target(dead1, vec![dead2], 0),
            "a.test",
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:18080".parse().unwrap(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::NoUpstream { .. }));
    }

    #[tokio::test]
    async fn test_preamble_written_before_anything_else() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let outcome = dial(
            &target(addr, vec![], 1),
            "a.test",
            "10.0.0.2:45000".parse().unwrap(),
            "10.0.0.1:18080".parse().unwrap(),
        )
        .await
        .unwrap();

        // Close our side so the accept task's read returns.
        drop(outcome);

        let first_bytes = accept.await.unwrap();
        assert_eq!(
            first_bytes,
            b"PROXY TCP4 10.0.0.2 10.0.0.1 45000 18080\r\n".to_vec()
        );
    }
}
