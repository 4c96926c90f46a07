//! Context-triggered piecewise hashing for fuzzy artifact matching.
//!
//! Digests have the shape `blocksize:digest1:digest2`, where `digest1` is
//! built from pieces cut at `blocksize` trigger points and `digest2` from
//! pieces cut at `2 * blocksize`. Two artifacts that share most of their
//! content share most of their piece hashes, so their digests are close in
//! edit distance.
//!
//! Comparison yields a score on `0..=100`. Digests whose block sizes differ
//! by more than a factor of two are incomparable and score 0.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

const ROLLING_WINDOW: usize = 7;
const MIN_BLOCKSIZE: u32 = 3;
const HASH_PRIME: u32 = 0x0100_0193;
const HASH_INIT: u32 = 0x2802_1967;

/// Maximum length of `digest1`; `digest2` is capped at half of this.
pub const SPAMSUM_LENGTH: usize = 64;

const B64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// A parsed similarity digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilarityDigest {
    block_size: u32,
    first: String,
    second: String,
}

/// Error returned when a stored digest string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid similarity digest: {0}")]
pub struct ParseDigestError(String);

impl SimilarityDigest {
    /// Computes the digest of an in-memory buffer.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        // Reading from a slice cannot fail.
        Self::compute(data.len() as u64, || Ok(data)).unwrap_or_else(|_| Self::empty())
    }

    /// Computes the digest of the file at `path`, streaming its contents.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened or read.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let len = std::fs::metadata(path)?.len();
        Self::compute(len, || File::open(path).map(BufReader::new))
    }

    /// Block size used for `digest1`.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Scores the similarity of two digests on `0..=100`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> u32 {
        let (bs1, bs2) = (self.block_size, other.block_size);
        if bs1 != bs2 && bs1.checked_mul(2) != Some(bs2) && bs2.checked_mul(2) != Some(bs1) {
            return 0;
        }

        let a1 = collapse_runs(&self.first);
        let a2 = collapse_runs(&self.second);
        let b1 = collapse_runs(&other.first);
        let b2 = collapse_runs(&other.second);

        if bs1 == bs2 && a1 == b1 && a2 == b2 {
            return 100;
        }

        if bs1 == bs2 {
            score_strings(&a1, &b1, bs1).max(score_strings(&a2, &b2, bs1.saturating_mul(2)))
        } else if bs1 > bs2 {
            score_strings(&a1, &b2, bs1)
        } else {
            score_strings(&a2, &b1, bs2)
        }
    }

    fn empty() -> Self {
        Self {
            block_size: MIN_BLOCKSIZE,
            first: String::new(),
            second: String::new(),
        }
    }

    fn compute<R, F>(len: u64, mut open: F) -> io::Result<Self>
    where
        R: Read,
        F: FnMut() -> io::Result<R>,
    {
        let mut block_size = MIN_BLOCKSIZE;
        while u64::from(block_size) * (SPAMSUM_LENGTH as u64) < len {
            block_size = block_size.saturating_mul(2);
        }

        loop {
            let (first, second) = digest_pass(open()?, block_size)?;
            if block_size > MIN_BLOCKSIZE && first.len() < SPAMSUM_LENGTH / 2 {
                block_size /= 2;
                continue;
            }
            return Ok(Self {
                block_size,
                first,
                second,
            });
        }
    }
}

impl fmt::Display for SimilarityDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.block_size, self.first, self.second)
    }
}

impl FromStr for SimilarityDigest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(bs), Some(first), Some(second)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseDigestError("expected blocksize:digest1:digest2".into()));
        };
        let block_size: u32 = bs
            .parse()
            .map_err(|_| ParseDigestError(format!("bad block size {bs:?}")))?;
        if block_size < MIN_BLOCKSIZE || !(block_size / MIN_BLOCKSIZE).is_power_of_two()
            || block_size % MIN_BLOCKSIZE != 0
        {
            return Err(ParseDigestError(format!("bad block size {block_size}")));
        }
        // ssdeep tools may append ",\"filename\"" to the second part.
        let second = second.split(',').next().unwrap_or_default();
        for part in [first, second] {
            if part.len() > SPAMSUM_LENGTH || !part.bytes().all(|b| B64.contains(&b)) {
                return Err(ParseDigestError(format!("bad digest part {part:?}")));
            }
        }
        Ok(Self {
            block_size,
            first: first.to_string(),
            second: second.to_string(),
        })
    }
}

#[derive(Default)]
struct RollingHash {
    window: [u8; ROLLING_WINDOW],
    h1: u32,
    h2: u32,
    h3: u32,
    n: usize,
}

impl RollingHash {
    fn roll(&mut self, c: u8) -> u32 {
        let c32 = u32::from(c);
        self.h2 = self.h2.wrapping_sub(self.h1);
        self.h2 = self.h2.wrapping_add((ROLLING_WINDOW as u32).wrapping_mul(c32));
        self.h1 = self.h1.wrapping_add(c32);
        self.h1 = self
            .h1
            .wrapping_sub(u32::from(self.window[self.n % ROLLING_WINDOW]));
        self.window[self.n % ROLLING_WINDOW] = c;
        self.n = self.n.wrapping_add(1);
        self.h3 = (self.h3 << 5) ^ c32;
        self.h1.wrapping_add(self.h2).wrapping_add(self.h3)
    }
}

const fn piece_hash(c: u8, h: u32) -> u32 {
    h.wrapping_mul(HASH_PRIME) ^ (c as u32)
}

fn b64_char(h: u32) -> char {
    char::from(B64[(h % 64) as usize])
}

fn digest_pass<R: Read>(mut reader: R, block_size: u32) -> io::Result<(String, String)> {
    let double = block_size.saturating_mul(2);
    let mut roll = RollingHash::default();
    let (mut h1, mut h2) = (HASH_INIT, HASH_INIT);
    let (mut pending1, mut pending2) = (false, false);
    let mut first = String::with_capacity(SPAMSUM_LENGTH);
    let mut second = String::with_capacity(SPAMSUM_LENGTH / 2);

    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for &c in &buf[..n] {
            h1 = piece_hash(c, h1);
            h2 = piece_hash(c, h2);
            pending1 = true;
            pending2 = true;
            let rolling = roll.roll(c);

            if rolling % block_size == block_size - 1 && first.len() < SPAMSUM_LENGTH - 1 {
                first.push(b64_char(h1));
                h1 = HASH_INIT;
                pending1 = false;
            }
            if rolling % double == double - 1 && second.len() < SPAMSUM_LENGTH / 2 - 1 {
                second.push(b64_char(h2));
                h2 = HASH_INIT;
                pending2 = false;
            }
        }
    }
    if pending1 {
        first.push(b64_char(h1));
    }
    if pending2 {
        second.push(b64_char(h2));
    }
    Ok((first, second))
}

/// Collapses runs of more than three identical characters to three; long
/// runs carry little information and inflate scores.
fn collapse_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run = 0usize;
    let mut prev = None;
    for c in s.chars() {
        if Some(c) == prev {
            run += 1;
        } else {
            run = 1;
            prev = Some(c);
        }
        if run <= 3 {
            out.push(c);
        }
    }
    out
}

fn has_common_substring(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() < ROLLING_WINDOW || b.len() < ROLLING_WINDOW {
        return false;
    }
    a.windows(ROLLING_WINDOW)
        .any(|wa| b.windows(ROLLING_WINDOW).any(|wb| wa == wb))
}

/// Edit distance with insert/delete cost 1 and substitution cost 2.
fn edit_distance(a: &str, b: &str) -> usize {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitute = prev[j] + if ca == cb { 0 } else { 2 };
            cur[j + 1] = substitute.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

fn score_strings(a: &str, b: &str, block_size: u32) -> u32 {
    if a.len() > SPAMSUM_LENGTH || b.len() > SPAMSUM_LENGTH || !has_common_substring(a, b) {
        return 0;
    }
    let distance = edit_distance(a, b);
    let scaled = distance * SPAMSUM_LENGTH / (a.len() + b.len());
    let penalty = 100 * scaled / SPAMSUM_LENGTH;
    if penalty >= 100 {
        return 0;
    }
    let mut score = (100 - penalty) as u32;

    // Small block sizes over short digests over-report similarity.
    let uncapped_from = (99 + ROLLING_WINDOW as u32) / ROLLING_WINDOW as u32 * MIN_BLOCKSIZE;
    if block_size < uncapped_from {
        let cap = (block_size / MIN_BLOCKSIZE) * a.len().min(b.len()) as u32;
        score = score.min(cap);
    }
    score
}
