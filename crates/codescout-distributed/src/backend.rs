//! One backend connection: send the query, stream JSON messages back.
//!
//! The wire protocol is a single JSON request followed by EOF of our write
//! half; the backend answers with back-to-back JSON objects (no framing)
//! until it closes the stream. Any decoding error aborts this backend only.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Connect to `addr`, send `request`, and hand every decoded JSON object to
/// `on_message` until EOF, cancellation, or an inactivity deadline.
pub(crate) async fn stream_results<F, C>(
    addr: &str,
    request: &[u8],
    connect_timeout: Duration,
    read_deadline: Duration,
    cancelled: C,
    mut on_message: F,
) -> Result<()>
where
    F: FnMut(serde_json::Value) -> Result<()>,
    C: Fn() -> bool,
{
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("connect to {} timed out", addr))?
        .with_context(|| format!("connect to {}", addr))?;
    let (mut rd, mut wr) = stream.into_split();
    wr.write_all(request).await.context("send query")?;
    wr.shutdown().await.context("close write half")?;
    drop(wr);

    let mut buf: Vec<u8> = Vec::with_capacity(8 << 10);
    let mut chunk = [0u8; 8 << 10];
    loop {
        if cancelled() {
            return Ok(());
        }
        let n = tokio::time::timeout(read_deadline, rd.read(&mut chunk))
            .await
            .with_context(|| format!("no data from {} within {:?}", addr, read_deadline))?
            .context("read backend stream")?;
        if n == 0 {
            return Ok(()); // EOF
        }
        buf.extend_from_slice(&chunk[..n]);

        // Drain every complete JSON value from the front of the buffer.
        let mut consumed = 0usize;
        {
            let mut values =
                serde_json::Deserializer::from_slice(&buf).into_iter::<serde_json::Value>();
            loop {
                match values.next() {
                    Some(Ok(v)) => {
                        consumed = values.byte_offset();
                        on_message(v)?;
                        if cancelled() {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => return Err(e).context("decode backend stream"),
                    None => break,
                }
            }
        }
        buf.drain(..consumed);
    }
}
