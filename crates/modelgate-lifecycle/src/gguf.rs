// Minimal GGUF header reader
//
// Pulls just enough metadata out of a GGUF file to refine VRAM estimates:
// layer count and embedding width. The value section is skipped with seeks,
// so large tokenizer arrays cost nothing.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
// A header claiming more KV pairs than this is corrupt
const MAX_KV_COUNT: u64 = 100_000;
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GgufMetadata {
    pub version: u32,
    pub architecture: Option<String>,
    pub block_count: Option<u64>,
    pub embedding_length: Option<u64>,
}

/// Read the GGUF header. Returns None when the file is not GGUF or the
/// header is malformed; estimation falls back to name heuristics then.
pub fn read_gguf_metadata(path: &Path) -> Option<GgufMetadata> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    parse_header(&mut reader).ok()
}

fn parse_header<R: Read + Seek>(r: &mut R) -> std::io::Result<GgufMetadata> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != GGUF_MAGIC {
        return Err(bad("not a GGUF file"));
    }

    let version = read_u32(r)?;
    let _tensor_count = read_u64(r)?;
    let kv_count = read_u64(r)?;
    if kv_count > MAX_KV_COUNT {
        return Err(bad("implausible metadata count"));
    }

    let mut meta = GgufMetadata {
        version,
        ..Default::default()
    };

    for _ in 0..kv_count {
        let key = read_string(r)?;
        let value_type = read_u32(r)?;

        // Keys are namespaced by architecture, e.g. "llama.block_count"
        if key == "general.architecture" && value_type == 8 {
            meta.architecture = Some(read_string(r)?);
            continue;
        }
        if key.ends_with(".block_count") {
            if let Some(v) = read_uint_value(r, value_type)? {
                meta.block_count = Some(v);
                continue;
            }
        } else if key.ends_with(".embedding_length") {
            if let Some(v) = read_uint_value(r, value_type)? {
                meta.embedding_length = Some(v);
                continue;
            }
        } else {
            skip_value(r, value_type)?;
            continue;
        }
        // Unsigned read fell through (unexpected type): value already consumed
    }

    Ok(meta)
}

fn bad(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read + Seek>(r: &mut R) -> std::io::Result<String> {
    let len = read_u64(r)?;
    if len > MAX_STRING_LEN {
        return Err(bad("implausible string length"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read an integer-typed value; consumes the value either way
fn read_uint_value<R: Read + Seek>(r: &mut R, value_type: u32) -> std::io::Result<Option<u64>> {
    Ok(match value_type {
        0 | 1 | 7 => {
            let mut b = [0u8; 1];
            r.read_exact(&mut b)?;
            Some(b[0] as u64)
        }
        2 | 3 => {
            let mut b = [0u8; 2];
            r.read_exact(&mut b)?;
            Some(u16::from_le_bytes(b) as u64)
        }
        4 | 5 => Some(read_u32(r)? as u64),
        10 | 11 => Some(read_u64(r)?),
        other => {
            skip_value(r, other)?;
            None
        }
    })
}

fn skip_value<R: Read + Seek>(r: &mut R, value_type: u32) -> std::io::Result<()> {
    match value_type {
        0 | 1 | 7 => {
            r.seek(SeekFrom::Current(1))?;
        }
        2 | 3 => {
            r.seek(SeekFrom::Current(2))?;
        }
        4 | 5 | 6 => {
            r.seek(SeekFrom::Current(4))?;
        }
        10 | 11 | 12 => {
            r.seek(SeekFrom::Current(8))?;
        }
        8 => {
            let len = read_u64(r)?;
            if len > MAX_STRING_LEN {
                return Err(bad("implausible string length"));
            }
            r.seek(SeekFrom::Current(len as i64))?;
        }
        9 => {
            let elem_type = read_u32(r)?;
            let count = read_u64(r)?;
            if count > MAX_KV_COUNT * 1024 {
                return Err(bad("implausible array length"));
            }
            match elem_type {
                0 | 1 | 7 => {
                    r.seek(SeekFrom::Current(count as i64))?;
                }
                2 | 3 => {
                    r.seek(SeekFrom::Current(2 * count as i64))?;
                }
                4 | 5 | 6 => {
                    r.seek(SeekFrom::Current(4 * count as i64))?;
                }
                10 | 11 | 12 => {
                    r.seek(SeekFrom::Current(8 * count as i64))?;
                }
                8 => {
                    for _ in 0..count {
                        let len = read_u64(r)?;
                        if len > MAX_STRING_LEN {
                            return Err(bad("implausible string length"));
                        }
                        r.seek(SeekFrom::Current(len as i64))?;
                    }
                }
                _ => return Err(bad("unknown array element type")),
            }
        }
        _ => return Err(bad("unknown value type")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn put_string(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u64).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    fn header(kvs: &[(&str, u32, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(GGUF_MAGIC);
        out.extend_from_slice(&3u32.to_le_bytes()); // version
        out.extend_from_slice(&0u64.to_le_bytes()); // tensor count
        out.extend_from_slice(&(kvs.len() as u64).to_le_bytes());
        for (key, value_type, payload) in kvs {
            put_string(&mut out, key);
            out.extend_from_slice(&value_type.to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn reads_layer_and_embedding_metadata() {
        let mut arch = Vec::new();
        put_string(&mut arch, "llama");
        let raw = header(&[
            ("general.architecture", 8, arch),
            ("llama.block_count", 4, 32u32.to_le_bytes().to_vec()),
            ("llama.embedding_length", 4, 4096u32.to_le_bytes().to_vec()),
            ("llama.rope.freq_base", 6, 10000f32.to_le_bytes().to_vec()),
        ]);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&raw).unwrap();
        let meta = read_gguf_metadata(file.path()).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.architecture.as_deref(), Some("llama"));
        assert_eq!(meta.block_count, Some(32));
        assert_eq!(meta.embedding_length, Some(4096));
    }

    #[test]
    fn skips_string_arrays() {
        let mut array = Vec::new();
        array.extend_from_slice(&8u32.to_le_bytes()); // element type: string
        array.extend_from_slice(&2u64.to_le_bytes());
        put_string(&mut array, "tok_a");
        put_string(&mut array, "tok_b");
        let raw = header(&[
            ("tokenizer.ggml.tokens", 9, array),
            ("llama.block_count", 10, 48u64.to_le_bytes().to_vec()),
        ]);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&raw).unwrap();
        let meta = read_gguf_metadata(file.path()).unwrap();
        assert_eq!(meta.block_count, Some(48));
    }

    #[test]
    fn non_gguf_file_yields_none() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"definitely not gguf").unwrap();
        assert!(read_gguf_metadata(file.path()).is_none());
    }
}
