//! sha256 content digests
//!
//! Digests are rendered as `sha256:<hex>`. The hashing reader and writer
//! wrap a byte stream and fold every byte that moves through them into the
//! digest, so the digest always describes the bytes actually transferred.

use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{self, Read, Write};

const ALGORITHM: &str = "sha256";

/// Digest of zero bytes
pub const EMPTY_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A `sha256:<hex>` content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Digest of a byte slice
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(bytes))
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{}:{}", ALGORITHM, hex::encode(hasher.finalize())))
    }

    /// The digest of no content
    pub fn empty() -> Self {
        Self(EMPTY_DIGEST.to_string())
    }

    /// Parse a digest, accepting either `sha256:<hex>` or a bare hex string
    pub fn parse(value: &str) -> KilnResult<Self> {
        let hex_part = value
            .strip_prefix("sha256:")
            .unwrap_or(value);

        let valid = hex_part.len() == 64
            && hex_part
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if !valid {
            return Err(KilnError::InvalidChainId(value.to_string()));
        }

        Ok(Self(format!("{}:{}", ALGORITHM, hex_part)))
    }

    /// The hex portion of the digest
    pub fn hex(&self) -> &str {
        &self.0[ALGORITHM.len() + 1..]
    }

    /// The full `sha256:<hex>` form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = KilnError;

    fn try_from(value: String) -> KilnResult<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Chain identity of a layer given its parent's chain id
///
/// The root layer's chain id is its own content digest. Every other layer
/// hashes `"<parent chain hex> <content hex>"`.
pub fn chain_id(parent: Option<&Digest>, content: &Digest) -> Digest {
    match parent {
        None => content.clone(),
        Some(parent) => {
            Digest::from_bytes(format!("{} {}", parent.hex(), content.hex()).as_bytes())
        }
    }
}

/// Reader that hashes everything read through it
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Consume the rest of the stream so trailing padding is hashed too,
    /// then return the digest
    pub fn finish(mut self) -> io::Result<Digest> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(Digest::from_hasher(self.hasher))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer that hashes everything written through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finish(mut self) -> io::Result<(W, Digest)> {
        self.inner.flush()?;
        Ok((self.inner, Digest::from_hasher(self.hasher)))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
