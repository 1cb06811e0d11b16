// Socket ownership: buffered writes behind a mutex, frame reads for the
// reader pump, and an idempotent shutdown.
//
// The write mutex serializes whole frames, so concurrent producers can
// never interleave bytes on the wire; on-wire order is the order of
// mutex acquisition.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::constants::{DEFAULT_SOCKET_BUFFER, MAX_INBOUND_FRAME_SIZE};
use super::error::{Result, StreamError};

pub(crate) struct Socket {
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    open: AtomicBool,
}

impl Socket {
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        Socket {
            writer: Mutex::new(BufWriter::with_capacity(DEFAULT_SOCKET_BUFFER, write_half)),
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Write one complete frame and flush. Returns `Closed` once the
    /// socket has been shut down.
    pub async fn write_and_flush(&self, frame: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(StreamError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the connection. Runs exactly once no matter how many
    /// callers race; later calls are no-ops.
    pub async fn shutdown(&self, cause: Option<&StreamError>) {
        if self.open.swap(false, Ordering::SeqCst) {
            match cause {
                Some(err) => warn!("closing connection: {err}"),
                None => debug!("closing connection"),
            }
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

/// Read one complete frame off the connection: the u32 size prefix,
/// then that many bytes. Returns `None` on clean EOF at a frame
/// boundary; EOF mid-frame is a transport error.
pub(crate) async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<Bytes>> {
    let mut size_buf = [0u8; 4];
    match reader.read_exact(&mut size_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!("connection closed by peer (EOF on size read)");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(size_buf);
    if size < 4 || size > MAX_INBOUND_FRAME_SIZE {
        return Err(StreamError::protocol(format!("invalid frame size {size}")));
    }

    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_write_after_shutdown_is_closed() {
        let (client, _server) = socket_pair().await;
        let (_read, write) = client.into_split();
        let socket = Socket::new(write);

        assert!(socket.is_open());
        socket.shutdown(None).await;
        socket.shutdown(None).await; // second call is a no-op
        assert!(!socket.is_open());
        assert!(matches!(
            socket.write_and_flush(b"x").await,
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_none() {
        let (client, server) = socket_pair().await;
        drop(server);
        let (read, _write) = client.into_split();
        let mut reader = BufReader::new(read);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_returns_body() {
        let (client, mut server) = socket_pair().await;
        server.write_all(&5u32.to_be_bytes()).await.unwrap();
        server.write_all(b"hello").await.unwrap();

        let (read, _write) = client.into_split();
        let mut reader = BufReader::new(read);
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let (client, mut server) = socket_pair().await;
        server.write_all(&100u32.to_be_bytes()).await.unwrap();
        server.write_all(b"short").await.unwrap();
        drop(server);

        let (read, _write) = client.into_split();
        let mut reader = BufReader::new(read);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(StreamError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let (client, mut server) = socket_pair().await;
        server
            .write_all(&(MAX_INBOUND_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        let (read, _write) = client.into_split();
        let mut reader = BufReader::new(read);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(StreamError::Protocol { .. })
        ));
    }
}
