//! Chunked reads of attachment byte sources.
//!
//! The archive's attachment streams expose no "read everything" call and may
//! return short reads. A read that fills the whole chunk means more data may
//! follow; a short read marks the end of the stream.

use std::io::Read;

/// Default chunk size requested from attachment sources.
pub const DEFAULT_CHUNK_SIZE: usize = 8176;

/// Read `source` until a read returns fewer than `chunk_size` bytes.
///
/// Only the bytes actually returned by each read are kept. Errors are not
/// retried.
pub fn read_all<R: Read + ?Sized>(source: &mut R, chunk_size: usize) -> std::io::Result<Vec<u8>> {
    let chunk_size = chunk_size.max(1);
    let mut chunk = vec![0u8; chunk_size];
    let mut data = Vec::new();

    loop {
        let n = source.read(&mut chunk)?;
        data.extend_from_slice(&chunk[..n]);
        if n < chunk_size {
            break;
        }
    }

    Ok(data)
}
