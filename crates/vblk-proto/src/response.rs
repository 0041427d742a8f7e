//! NBD simple reply encoding.
//!
//! Every reply is 16 bytes — magic(4), error(4), handle(8) — followed by the
//! read payload for successful reads. Like [`Request`](crate::Request),
//! `Response` values are recycled and retain their data buffer capacity.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::VbdResult;
use crate::request::{Request, RequestKind};
use crate::{HANDLE_LEN, REPLY_HEADER_LEN};

/// A reply queued for the response writer.
#[derive(Debug, Default)]
pub struct Response {
    kind: Option<RequestKind>,
    handle: [u8; HANDLE_LEN],
    err_code: u32,
    /// Read payload buffer; sized per request, capacity retained.
    pub data: Vec<u8>,
}

impl Response {
    /// Prepare the reply header for `req` with the given wire error code.
    pub fn set(&mut self, req: &Request, err_code: u32) {
        self.kind = req.kind;
        self.handle = req.handle;
        self.err_code = err_code;
    }

    /// Size `data` to hold the read payload for `req`, growing the buffer on
    /// demand while keeping any larger prior capacity.
    pub fn read_buffer(&mut self, req: &Request) -> &mut [u8] {
        let need = req.len as usize;
        if self.data.capacity() < need {
            self.data = vec![0u8; need];
        } else {
            self.data.resize(need, 0);
        }
        &mut self.data
    }

    /// Whether this reply carries a read payload.
    fn carries_data(&self) -> bool {
        self.kind == Some(RequestKind::Read) && self.err_code == crate::NBD_OK
    }

    /// Encode this reply onto `strm`.
    pub async fn write<W>(&self, strm: &mut W) -> VbdResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut header = [0u8; REPLY_HEADER_LEN];
        header[0..4].copy_from_slice(&crate::NBD_REPLY_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&self.err_code.to_be_bytes());
        header[8..16].copy_from_slice(&self.handle);
        strm.write_all(&header).await?;

        if self.carries_data() {
            strm.write_all(&self.data).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_request(handle: u64, len: u32) -> Request {
        Request {
            kind: Some(RequestKind::Read),
            handle: handle.to_be_bytes(),
            pos: 0,
            len,
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn encodes_success_read_reply_with_data() {
        let req = read_request(0x1122_3344_5566_7788, 4);
        let mut resp = Response::default();
        resp.read_buffer(&req).copy_from_slice(&[9, 8, 7, 6]);
        resp.set(&req, crate::NBD_OK);

        let mut wire = Vec::new();
        resp.write(&mut wire).await.unwrap();

        assert_eq!(wire.len(), REPLY_HEADER_LEN + 4);
        assert_eq!(&wire[0..4], &crate::NBD_REPLY_MAGIC.to_be_bytes());
        assert_eq!(&wire[4..8], &crate::NBD_OK.to_be_bytes());
        assert_eq!(&wire[8..16], &0x1122_3344_5566_7788u64.to_be_bytes());
        assert_eq!(&wire[16..], &[9, 8, 7, 6]);
    }

    #[tokio::test]
    async fn failed_read_reply_omits_data() {
        let req = read_request(1, 4096);
        let mut resp = Response::default();
        resp.read_buffer(&req);
        resp.set(&req, crate::NBD_EIO);

        let mut wire = Vec::new();
        resp.write(&mut wire).await.unwrap();
        assert_eq!(wire.len(), REPLY_HEADER_LEN);
        assert_eq!(&wire[4..8], &crate::NBD_EIO.to_be_bytes());
    }

    #[tokio::test]
    async fn write_reply_is_header_only() {
        let req = Request {
            kind: Some(RequestKind::Write),
            handle: [2; 8],
            pos: 0,
            len: 4096,
            payload: vec![0; 4096],
        };
        let mut resp = Response::default();
        resp.set(&req, crate::NBD_OK);

        let mut wire = Vec::new();
        resp.write(&mut wire).await.unwrap();
        assert_eq!(wire.len(), REPLY_HEADER_LEN);
    }
}
