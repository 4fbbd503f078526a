use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// Writes length-prefixed frames to a stream.
///
/// The header and control bodies are staged in a reused buffer, numeric payloads are
/// written straight from the caller's slice.
pub struct MsgSender<W: AsyncWrite + Unpin> {
    tx: W,
    staging: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> MsgSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            staging: Vec::new(),
        }
    }

    /// Frames `msg` and writes it out, flushing afterwards.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// # Returns
    /// An `io::Error` if serializing or writing fails.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { tx, staging } = self;

        staging.clear();
        staging.resize(LEN_TYPE_SIZE, 0);

        let borrowed = msg.serialize(staging)?;
        let body_len = staging.len() - LEN_TYPE_SIZE + borrowed.map_or(0, <[u8]>::len);
        staging[..LEN_TYPE_SIZE].copy_from_slice(&(body_len as LenType).to_be_bytes());

        tx.write_all(staging).await?;
        if let Some(payload) = borrowed {
            tx.write_all(payload).await?;
        }

        tx.flush().await
    }
}
