//! Opaque bidirectional relay for `CONNECT` requests.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const PUMP_BUF_SIZE: usize = 64 * 1024;

/// Acknowledge the tunnel, connect to the remote, and relay bytes both ways
/// until each half closes.
///
/// The `200 Connection Established` is written before the remote dial; if the
/// dial fails the client is closed silently, with no retry. No flow is
/// registered for tunneled traffic.
pub(crate) async fn run<R, W>(
    client_reader: &mut R,
    client_writer: &mut W,
    host: &str,
    port: u16,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    client_writer
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    client_writer.flush().await?;

    let remote = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::debug!("tunnel connect to {host}:{port} failed: {err}");
            let _ = client_writer.shutdown().await;
            return Ok(());
        }
    };
    tracing::debug!("tunnel established to {host}:{port}");

    let (mut remote_reader, mut remote_writer) = remote.into_split();
    tokio::join!(
        pump(client_reader, &mut remote_writer),
        pump(&mut remote_reader, client_writer),
    );
    Ok(())
}

/// Copy until EOF or error, then close the destination's write half.
async fn pump<R, W>(src: &mut R, dst: &mut W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUF_SIZE];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if dst.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                if dst.flush().await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = dst.shutdown().await;
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn relays_bytes_both_ways_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stream.write_all(&buf[..n]).await.unwrap(),
                }
            }
        });

        let (client, mut ours) = duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let tunnel = tokio::spawn(async move {
            run(&mut client_read, &mut client_write, "127.0.0.1", addr.port())
                .await
                .unwrap();
        });

        let mut established = [0u8; 39];
        ours.read_exact(&mut established).await.unwrap();
        assert_eq!(&established[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

        let payload = b"arbitrary \x00\xff bytes";
        ours.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        ours.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        ours.shutdown().await.unwrap();
        drop(ours);
        tunnel.await.unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_remote_closes_client_silently() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (client, mut ours) = duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let tunnel = tokio::spawn(async move {
            run(&mut client_read, &mut client_write, "127.0.0.1", port)
                .await
                .unwrap();
        });

        let mut response = Vec::new();
        ours.read_to_end(&mut response).await.unwrap();
        assert_eq!(&response[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");
        tunnel.await.unwrap();
    }
}
