use bytes::{BufMut, Bytes, BytesMut};
use tokio::task::spawn_blocking;

use super::StorageError;

/// First byte of every stored body.
const MARKER_RAW: u8 = 0;
const MARKER_ZSTD: u8 = 1;

/// Compression work below this size is cheaper done inline than shipped to
/// the blocking pool.
const INPLACE_THRESHOLD: usize = 4096;

/// Prefixes the body with a compression marker, compressing with zstd when
/// it exceeds `threshold` bytes.
pub async fn compress_body(
    body: Bytes,
    threshold: usize,
    level: i32,
) -> Result<Bytes, StorageError> {
    if body.len() <= threshold {
        let mut out = BytesMut::with_capacity(body.len() + 1);
        out.put_u8(MARKER_RAW);
        out.extend_from_slice(&body);
        return Ok(out.freeze());
    }

    let compressed = if body.len() <= INPLACE_THRESHOLD {
        zstd::stream::encode_all(&body[..], level)
    } else {
        spawn_blocking(move || zstd::stream::encode_all(&body[..], level))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
    }
    .map_err(|e| StorageError::Backend(e.to_string()))?;

    let mut out = BytesMut::with_capacity(compressed.len() + 1);
    out.put_u8(MARKER_ZSTD);
    out.extend_from_slice(&compressed);
    Ok(out.freeze())
}

/// Inspects the marker byte and returns the original body bytes.
pub async fn decompress_body(stored: Bytes) -> Result<Bytes, StorageError> {
    let Some((&marker, payload)) = stored.split_first() else {
        return Ok(Bytes::new());
    };
    match marker {
        MARKER_RAW => Ok(stored.slice(1..)),
        MARKER_ZSTD => {
            let decoded = if payload.len() <= INPLACE_THRESHOLD {
                zstd::stream::decode_all(payload)
            } else {
                let payload = stored.slice(1..);
                spawn_blocking(move || zstd::stream::decode_all(&payload[..]))
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?
            }
            .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(Bytes::from(decoded))
        }
        other => Err(StorageError::Backend(format!(
            "unknown compression marker {other}"
        ))),
    }
}
