use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType};

/// The largest frame a `MsgReceiver` accepts, in bytes.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Reads length-prefixed frames off a stream.
pub struct MsgReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> MsgReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Reads the next frame into `buf` and decodes it in place.
    ///
    /// `buf` is only ever grown, numeric payloads borrow straight from it.
    ///
    /// # Arguments
    /// * `buf` - The frame storage, the decoded message borrows from it.
    ///
    /// # Returns
    /// The decoded message, or `InvalidData` for frames over `MAX_FRAME_LEN`.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut header = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut header).await?;

        let len = usize::try_from(LenType::from_be_bytes(header))
            .ok()
            .filter(|&len| len <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "frame exceeds the maximum length")
            })?;

        let words = len.div_ceil(size_of::<B>());
        buf.clear();
        buf.resize(words, bytemuck::Zeroable::zeroed());

        let bytes = &mut bytemuck::cast_slice_mut::<B, u8>(buf.as_mut_slice())[..len];
        self.rx.read_exact(bytes).await?;

        T::deserialize(bytes)
    }
}
