//! Length-prefixed package framing for TCP transport
//!
//! Each package is prefixed with a 4-byte big-endian length followed by the
//! JSON package body. TCP may split or coalesce writes, so the reader keeps a
//! receive buffer and pulls complete frames out of it.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::protocol::constants::MAX_PACKAGE_SIZE;
use crate::protocol::DataPackage;
use crate::{Error, Result};

const LEN_PREFIX: usize = 4;

/// Outcome of pulling one package out of a receive buffer
#[derive(Debug)]
pub enum PackageDecode {
    /// A complete, well-formed package; its frame was consumed
    Package(DataPackage),
    /// The buffer does not yet hold a complete frame; nothing was consumed
    NeedMoreBytes,
    /// A complete frame whose body was rejected; the frame was consumed so the
    /// next one can still be read
    Malformed(Error),
}

/// Encode a package as one length-prefixed frame
pub fn encode_package(package: &DataPackage) -> Result<Vec<u8>> {
    let body = package.to_bytes()?;

    if body.len() > MAX_PACKAGE_SIZE {
        return Err(Error::InvalidPackage(format!(
            "package too large: {} bytes (max {})",
            body.len(),
            MAX_PACKAGE_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend(body);
    Ok(frame)
}

/// Remove one complete frame body from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. An oversized length prefix
/// is an error: the stream can no longer be resynchronized.
pub fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let mut len_buf = [0u8; LEN_PREFIX];
    len_buf.copy_from_slice(&buf[..LEN_PREFIX]);
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_PACKAGE_SIZE {
        return Err(Error::InvalidPackage(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_PACKAGE_SIZE
        )));
    }

    if buf.len() < LEN_PREFIX + len {
        return Ok(None);
    }

    let body = buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
    buf.drain(..LEN_PREFIX + len);
    Ok(Some(body))
}

/// Decode the next package frame from a receive buffer
pub fn decode_package(buf: &mut Vec<u8>) -> Result<PackageDecode> {
    match take_frame(buf)? {
        None => Ok(PackageDecode::NeedMoreBytes),
        Some(body) => match DataPackage::from_bytes(&body) {
            Ok(package) => Ok(PackageDecode::Package(package)),
            Err(e) => Ok(PackageDecode::Malformed(e)),
        },
    }
}

/// Write an already framed package to an async writer and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await
        .map_err(|e| Error::Network(e.to_string()))?;

    // Flush to ensure data is sent
    writer.flush().await
        .map_err(|e| Error::Network(e.to_string()))?;

    Ok(())
}
