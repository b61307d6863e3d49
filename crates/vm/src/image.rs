/// Program Image
///
/// Minimal container the binary boots from. All integers little-endian:
///
/// ```text
/// "RVMI" | entry: u64 | words: u64 | data_len: u64 | words × u64 | data_len × u8
/// ```

use std::path::Path;

pub const MAGIC: &[u8; 4] = b"RVMI";
const HEADER_LEN: usize = 4 + 3 * 8;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("not a program image (bad magic)")]
    BadMagic,
    #[error("image truncated: need {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("{0} trailing bytes after image data")]
    TrailingBytes(usize),
    #[error("entry point {entry} outside {words} instruction words")]
    EntryOutOfRange { entry: u64, words: usize },
    #[error("image too large")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn read_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_le(bytemuck::pod_read_unaligned(chunk)))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramImage {
    pub instructions: Vec<u64>,
    pub data: Vec<u8>,
    /// Word index core 0 starts at
    pub entry: u64,
}

impl ProgramImage {
    pub fn new(instructions: Vec<u64>, data: Vec<u8>) -> Self {
        Self {
            instructions,
            data,
            entry: 0,
        }
    }

    pub fn with_entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_LEN {
            if !bytes.starts_with(&MAGIC[..bytes.len().min(4)]) {
                return Err(ImageError::BadMagic);
            }
            return Err(ImageError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if &bytes[..4] != MAGIC {
            return Err(ImageError::BadMagic);
        }

        let header = read_words(&bytes[4..HEADER_LEN]);
        let (entry, words, data_len) = (header[0], header[1], header[2]);

        let words = usize::try_from(words).map_err(|_| ImageError::TooLarge)?;
        let data_len = usize::try_from(data_len).map_err(|_| ImageError::TooLarge)?;
        let code_end = words
            .checked_mul(8)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or(ImageError::TooLarge)?;
        let end = code_end.checked_add(data_len).ok_or(ImageError::TooLarge)?;

        if bytes.len() < end {
            return Err(ImageError::Truncated {
                expected: end,
                actual: bytes.len(),
            });
        }
        if bytes.len() > end {
            return Err(ImageError::TrailingBytes(bytes.len() - end));
        }
        if entry >= words as u64 {
            return Err(ImageError::EntryOutOfRange { entry, words });
        }

        let instructions = read_words(&bytes[HEADER_LEN..code_end]);

        Ok(Self {
            instructions,
            data: bytes[code_end..end].to_vec(),
            entry,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = [
            self.entry.to_le(),
            (self.instructions.len() as u64).to_le(),
            (self.data.len() as u64).to_le(),
        ];
        let words: Vec<u64> = self.instructions.iter().map(|w| w.to_le()).collect();

        let mut out = Vec::with_capacity(HEADER_LEN + words.len() * 8 + self.data.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(bytemuck::cast_slice(&header[..]));
        out.extend_from_slice(bytemuck::cast_slice(&words[..]));
        out.extend_from_slice(&self.data);
        out
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}
