//! Chunk Transfer Module
//!
//! Client side of the chunk transfer protocol. Each operation opens its own
//! connection to the target's transfer endpoint, runs under a bounded
//! timeout, and is stateless per chunk: the caller needs no record of
//! in-flight transfers to retry a failed attempt.

use crate::protocol::{self, ChunkName, ErrorCode, Frame, Message, ProtocolError, DATA_FRAME_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Errors that can occur during a chunk transfer
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("chunk {chunk} not found on target")]
    NotFound { chunk: ChunkName },

    #[error("target refused the transfer: {message}")]
    Rejected { message: String },

    #[error("target capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    #[error("transfer timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("chunk {chunk} checksum mismatch: expected {expected:08x}, calculated {calculated:08x}")]
    ChecksumMismatch {
        chunk: ChunkName,
        expected: u32,
        calculated: u32,
    },

    #[error("data frame out of order: expected offset {expected}, found {found}")]
    OutOfOrderData { expected: u64, found: u64 },

    #[error("unexpected message during transfer: {context}")]
    UnexpectedMessage { context: String },

    #[error("connection closed mid-transfer")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

async fn bounded<T>(
    op_timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    match timeout(op_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout {
            seconds: op_timeout.as_secs(),
        }),
    }
}

/// Stream a chunk to a target, frame by frame, and wait for its verdict.
pub async fn upload_chunk(
    addr: SocketAddr,
    chunk: &ChunkName,
    bytes: &[u8],
    op_timeout: Duration,
) -> Result<(), TransferError> {
    bounded(op_timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        let checksum = crc32fast::hash(bytes);
        protocol::write_message(
            &mut stream,
            &Message::UploadChunk {
                chunk: chunk.clone(),
                total_size: bytes.len() as u64,
                checksum,
            },
        )
        .await?;

        let mut offset = 0u64;
        for piece in bytes.chunks(DATA_FRAME_SIZE) {
            protocol::write_data(&mut stream, offset, piece).await?;
            offset += piece.len() as u64;
        }

        match protocol::read_message(&mut stream).await? {
            Some(Message::UploadResult { success: true, size, .. }) => {
                debug!("Uploaded chunk {} ({} bytes) to {}", chunk, size, addr);
                Ok(())
            }
            Some(Message::UploadResult {
                success: false,
                message,
                ..
            }) => Err(TransferError::Rejected { message }),
            Some(Message::Error {
                code: ErrorCode::CapacityExceeded,
                message,
            }) => Err(TransferError::CapacityExceeded { message }),
            Some(Message::Error { message, .. }) => Err(TransferError::Rejected { message }),
            Some(other) => Err(TransferError::UnexpectedMessage {
                context: format!("upload response: {:?}", other),
            }),
            None => Err(TransferError::ConnectionClosed),
        }
    })
    .await
}

/// Fetch a chunk from a target. Nothing is written anywhere until the full
/// payload arrived and its checksum verified, so a transport failure leaves
/// no partial result behind.
pub async fn download_chunk(
    addr: SocketAddr,
    chunk: &ChunkName,
    op_timeout: Duration,
) -> Result<Vec<u8>, TransferError> {
    bounded(op_timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        protocol::write_message(
            &mut stream,
            &Message::DownloadChunk {
                chunk: chunk.clone(),
            },
        )
        .await?;

        let (total_size, checksum) = match protocol::read_message(&mut stream).await? {
            Some(Message::DownloadStart {
                total_size,
                checksum,
                ..
            }) => (total_size, checksum),
            Some(Message::Error {
                code: ErrorCode::NotFound,
                ..
            }) => {
                return Err(TransferError::NotFound {
                    chunk: chunk.clone(),
                })
            }
            Some(Message::Error { message, .. }) => {
                return Err(TransferError::Rejected { message })
            }
            Some(other) => {
                return Err(TransferError::UnexpectedMessage {
                    context: format!("download response: {:?}", other),
                })
            }
            None => return Err(TransferError::ConnectionClosed),
        };

        let mut bytes = Vec::with_capacity(total_size as usize);
        while (bytes.len() as u64) < total_size {
            match protocol::read_frame(&mut stream).await? {
                Some(Frame::Data {
                    offset,
                    bytes: piece,
                }) => {
                    if offset != bytes.len() as u64 {
                        return Err(TransferError::OutOfOrderData {
                            expected: bytes.len() as u64,
                            found: offset,
                        });
                    }
                    bytes.extend_from_slice(&piece);
                }
                Some(Frame::Control(message)) => {
                    return Err(TransferError::UnexpectedMessage {
                        context: format!("mid-stream control message: {:?}", message),
                    })
                }
                None => return Err(TransferError::ConnectionClosed),
            }
        }

        let calculated = crc32fast::hash(&bytes);
        if calculated != checksum {
            return Err(TransferError::ChecksumMismatch {
                chunk: chunk.clone(),
                expected: checksum,
                calculated,
            });
        }

        debug!("Downloaded chunk {} ({} bytes) from {}", chunk, total_size, addr);
        Ok(bytes)
    })
    .await
}

/// Ask a target to remove a stored chunk.
pub async fn delete_chunk(
    addr: SocketAddr,
    chunk: &ChunkName,
    op_timeout: Duration,
) -> Result<(), TransferError> {
    bounded(op_timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        protocol::write_message(
            &mut stream,
            &Message::DeleteChunk {
                chunk: chunk.clone(),
            },
        )
        .await?;

        match protocol::read_message(&mut stream).await? {
            Some(Message::DeleteResult { success: true, .. }) => {
                debug!("Deleted chunk {} on {}", chunk, addr);
                Ok(())
            }
            Some(Message::DeleteResult {
                success: false,
                message,
            }) => Err(TransferError::Rejected { message }),
            Some(Message::Error {
                code: ErrorCode::NotFound,
                ..
            }) => Err(TransferError::NotFound {
                chunk: chunk.clone(),
            }),
            Some(Message::Error { message, .. }) => Err(TransferError::Rejected { message }),
            Some(other) => Err(TransferError::UnexpectedMessage {
                context: format!("delete response: {:?}", other),
            }),
            None => Err(TransferError::ConnectionClosed),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Minimal single-connection server speaking the transfer protocol.
    async fn serve_one(listener: TcpListener, stored: Option<Vec<u8>>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        match protocol::read_message(&mut stream).await.unwrap().unwrap() {
            Message::UploadChunk { total_size, checksum, .. } => {
                let mut received = Vec::new();
                while (received.len() as u64) < total_size {
                    match protocol::read_frame(&mut stream).await.unwrap().unwrap() {
                        Frame::Data { bytes, .. } => received.extend_from_slice(&bytes),
                        other => panic!("unexpected frame: {:?}", other),
                    }
                }
                let ok = crc32fast::hash(&received) == checksum;
                protocol::write_message(
                    &mut stream,
                    &Message::UploadResult {
                        success: ok,
                        message: if ok { "stored".into() } else { "checksum mismatch".into() },
                        size: received.len() as u64,
                    },
                )
                .await
                .unwrap();
            }
            Message::DownloadChunk { chunk } => match stored {
                Some(bytes) => {
                    protocol::write_message(
                        &mut stream,
                        &Message::DownloadStart {
                            chunk,
                            total_size: bytes.len() as u64,
                            checksum: crc32fast::hash(&bytes),
                        },
                    )
                    .await
                    .unwrap();
                    let mut offset = 0u64;
                    for piece in bytes.chunks(DATA_FRAME_SIZE) {
                        protocol::write_data(&mut stream, offset, piece).await.unwrap();
                        offset += piece.len() as u64;
                    }
                }
                None => {
                    protocol::write_message(
                        &mut stream,
                        &Message::Error {
                            code: ErrorCode::NotFound,
                            message: "no such chunk".into(),
                        },
                    )
                    .await
                    .unwrap();
                }
            },
            Message::DeleteChunk { .. } => {
                protocol::write_message(
                    &mut stream,
                    &Message::DeleteResult {
                        success: true,
                        message: "deleted".into(),
                    },
                )
                .await
                .unwrap();
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    async fn spawn_server(stored: Option<Vec<u8>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_one(listener, stored));
        addr
    }

    #[tokio::test]
    async fn test_upload_roundtrip() {
        let addr = spawn_server(None).await;
        let chunk = ChunkName::new("abc", 0);
        let payload = vec![0x5A; 3 * DATA_FRAME_SIZE / 2];

        upload_chunk(addr, &chunk, &payload, TEST_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_download_roundtrip() {
        let payload = vec![0x42; 2048];
        let addr = spawn_server(Some(payload.clone())).await;
        let chunk = ChunkName::new("abc", 1);

        let bytes = download_chunk(addr, &chunk, TEST_TIMEOUT).await.unwrap();
        assert_eq!(bytes, payload);
    }

    #[tokio::test]
    async fn test_download_missing_chunk() {
        let addr = spawn_server(None).await;
        let chunk = ChunkName::new("missing", 2);

        let result = download_chunk(addr, &chunk, TEST_TIMEOUT).await;
        assert!(matches!(result, Err(TransferError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_roundtrip() {
        let addr = spawn_server(None).await;
        let chunk = ChunkName::new("abc", 3);

        delete_chunk(addr, &chunk, TEST_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_target_is_an_error() {
        // Port 1 on localhost is essentially never listening.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let chunk = ChunkName::new("abc", 0);

        let result = upload_chunk(addr, &chunk, b"payload", Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
