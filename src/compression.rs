use std::io::{Read, Write};
use anyhow::{anyhow, bail};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Payload compression, applied before encryption on send and after decryption on receive
pub trait CompressionAlgorithm: Send + Sync + 'static {
    fn compress(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn decompress(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn box_clone(&self) -> Box<dyn CompressionAlgorithm>;
}

#[derive(Clone, Default)]
pub struct DummyCompression {}
impl CompressionAlgorithm for DummyCompression {
    fn compress(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn decompress(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn box_clone(&self) -> Box<dyn CompressionAlgorithm> {
        Box::new(self.clone())
    }
}

/// zlib with a leading ratio byte:
///
/// ```ascii
/// 0: compression ratio, `uncompressed_len / compressed_len + 1`, or 0 if stored uncompressed
/// 1: zlib stream (or the raw payload for ratio 0)
/// ```
#[derive(Clone, Default)]
pub struct ZlibCompression {}
impl CompressionAlgorithm for ZlibCompression {
    fn compress(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;

        let ratio = payload.len() / compressed.len() + 1;
        let ratio = u8::try_from(ratio)
            .map_err(|_| anyhow!("compression ratio {} does not fit the ratio byte", ratio))?;

        let mut result = Vec::with_capacity(compressed.len() + 1);
        result.push(ratio);
        result.extend_from_slice(&compressed);
        Ok(result)
    }

    fn decompress(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let Some((&ratio, compressed)) = payload.split_first() else {
            bail!("compressed payload is missing its ratio byte");
        };
        if ratio == 0 {
            return Ok(compressed.to_vec());
        }
        if compressed.is_empty() {
            bail!("compressed payload with ratio {} has no data", ratio);
        }

        // the ratio byte bounds the output, which stops zlib bombs before they grow
        let limit = ratio as usize * compressed.len();
        let mut decompressed = Vec::new();
        ZlibDecoder::new(compressed)
            .take(limit as u64)
            .read_to_end(&mut decompressed)?;
        if decompressed.len() >= limit {
            bail!("decompressed payload exceeds the {} bytes announced by ratio {}", limit - 1, ratio);
        }

        let actual_ratio = decompressed.len() / compressed.len() + 1;
        if actual_ratio != ratio as usize {
            bail!("decompressed payload has ratio {}, expected {}", actual_ratio, ratio);
        }
        Ok(decompressed)
    }

    fn box_clone(&self) -> Box<dyn CompressionAlgorithm> {
        Box::new(self.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::short(b"abc".to_vec())]
    #[case::repetitive(vec![7u8; 2000])]
    #[case::empty(vec![])]
    fn test_zlib(#[case] payload: Vec<u8>) {
        let zlib = ZlibCompression::default();
        let compressed = zlib.compress(&payload).unwrap();
        assert_eq!(compressed[0] as usize, payload.len() / (compressed.len() - 1) + 1);
        assert_eq!(zlib.decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_zlib_stored_uncompressed() {
        assert_eq!(ZlibCompression::default().decompress(&[0, 1, 2, 3]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_zlib_ratio_mismatch() {
        let zlib = ZlibCompression::default();
        let mut compressed = zlib.compress(&vec![7u8; 2000]).unwrap();
        compressed[0] = compressed[0].wrapping_add(1);
        assert!(zlib.decompress(&compressed).is_err());
    }

    #[test]
    fn test_zlib_bomb_is_cut_off() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&vec![0u8; 16 * 1024 * 1024]).unwrap();
        let mut payload = vec![2u8];
        payload.extend(encoder.finish().unwrap());

        let error = ZlibCompression::default().decompress(&payload).unwrap_err();
        assert!(error.to_string().contains("exceeds"), "{}", error);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::garbage(vec![3, 1, 2, 3, 4])]
    fn test_zlib_invalid(#[case] payload: Vec<u8>) {
        assert!(ZlibCompression::default().decompress(&payload).is_err());
    }

    #[test]
    fn test_dummy() {
        let dummy = DummyCompression::default();
        assert_eq!(dummy.compress(b"abc").unwrap(), b"abc");
        assert_eq!(dummy.decompress(b"abc").unwrap(), b"abc");
    }
}
