//! NBD request decoding.
//!
//! Requests arrive as a 28-byte header, followed for writes by `length`
//! bytes of payload:
//!
//! ```text
//! +----------+----------+------------+------------+----------+
//! | magic(4) | type (4) | handle (8) | offset (8) | len (4)  |
//! +----------+----------+------------+------------+----------+
//! ```
//!
//! All integer fields are big-endian. `Request` values are meant to be
//! recycled: `decode` overwrites every field and reuses the payload buffer,
//! growing it on demand and never shrinking it.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{VbdError, VbdResult};
use crate::{HANDLE_LEN, REQUEST_HEADER_LEN};

/// Classified request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
    Unknown(u32),
}

impl From<u32> for RequestKind {
    fn from(raw: u32) -> Self {
        match raw {
            crate::NBD_CMD_READ => Self::Read,
            crate::NBD_CMD_WRITE => Self::Write,
            crate::NBD_CMD_DISC => Self::Disconnect,
            crate::NBD_CMD_FLUSH => Self::Flush,
            crate::NBD_CMD_TRIM => Self::Trim,
            other => Self::Unknown(other),
        }
    }
}

/// A decoded NBD request.
#[derive(Debug, Default)]
pub struct Request {
    /// Classified command type.
    pub kind: Option<RequestKind>,
    /// Opaque handle echoed back in the reply.
    pub handle: [u8; HANDLE_LEN],
    /// Byte offset of the operation.
    pub pos: u64,
    /// Byte length of the operation.
    pub len: u32,
    /// Write payload. Empty for non-write requests; capacity is retained
    /// across recycled decodes.
    pub payload: Vec<u8>,
}

impl Request {
    /// Decode one request from `strm`, reusing this value's buffers.
    ///
    /// A wrong magic or a short header read is fatal to the session and
    /// reported as [`VbdError::BadMagic`] / [`VbdError::Protocol`].
    pub async fn decode<R>(&mut self, strm: &mut R) -> VbdResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        strm.read_exact(&mut header)
            .await
            .map_err(|e| VbdError::Protocol(format!("short request header: {e}")))?;

        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != crate::NBD_REQUEST_MAGIC {
            return Err(VbdError::BadMagic(magic));
        }

        let raw_kind = u32::from_be_bytes(header[4..8].try_into().unwrap());
        self.kind = Some(RequestKind::from(raw_kind));
        self.handle.copy_from_slice(&header[8..16]);
        self.pos = u64::from_be_bytes(header[16..24].try_into().unwrap());
        self.len = u32::from_be_bytes(header[24..28].try_into().unwrap());

        if self.kind == Some(RequestKind::Write) {
            let need = self.len as usize;
            if self.payload.capacity() < need {
                self.payload = vec![0u8; need];
            } else {
                self.payload.resize(need, 0);
            }
            strm.read_exact(&mut self.payload)
                .await
                .map_err(|e| VbdError::Protocol(format!("short write payload: {e}")))?;
        } else {
            self.payload.clear();
        }

        Ok(())
    }
}
