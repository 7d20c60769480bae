use crate::error::{ProxyError, Side};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Per-direction copy buffer.
const BUFFER_SIZE: usize = 16 * 1024;

/// Full-duplex copy between the client and the upstream until both
/// directions reach EOF.
///
/// EOF on one side shuts down only the peer's write half, so the other
/// direction keeps flowing until it closes too. Any other error tears the
/// whole connection down: returning drops both streams.
///
/// Returns the byte counts (client->upstream, upstream->client).
pub async fn run<C, U>(mut client: C, mut upstream: U) -> Result<(u64, u64), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; BUFFER_SIZE];
    let mut upstream_buf = vec![0u8; BUFFER_SIZE];
    let mut sent = 0u64;
    let mut received = 0u64;
    let mut client_done = false;
    let mut upstream_done = false;

    let fail = |side: Side| move |source| ProxyError::PumpIo { side, source };

    loop {
        tokio::select! {
            result = client.read(&mut client_buf), if !client_done => {
                let n = result.map_err(fail(Side::ClientToUpstream))?;
                if n == 0 {
                    client_done = true;
                    upstream
                        .shutdown()
                        .await
                        .map_err(fail(Side::ClientToUpstream))?;
                } else {
                    upstream
                        .write_all(&client_buf[..n])
                        .await
                        .map_err(fail(Side::ClientToUpstream))?;
                    sent += n as u64;
                }
            }
            result = upstream.read(&mut upstream_buf), if !upstream_done => {
                let n = result.map_err(fail(Side::UpstreamToClient))?;
                if n == 0 {
                    upstream_done = true;
                    client
                        .shutdown()
                        .await
                        .map_err(fail(Side::UpstreamToClient))?;
                } else {
                    client
                        .write_all(&upstream_buf[..n])
                        .await
                        .map_err(fail(Side::UpstreamToClient))?;
                    received += n as u64;
                }
            }
            else => break,
        }
    }

    Ok((sent, received))
}
