//! Piece commitment (commP) calculation.
//!
//! The transferred CAR file is fingerprinted with a binary merkle tree of
//! SHA-256 hashes over 32-byte nodes, with the two most significant bits of
//! each node's last byte zeroed so every node fits the proof system's field.
//! The resulting root is wrapped into a `fil-commitment-unsealed` CID.

use std::io::Read;

use cid::{multihash::Multihash, Cid};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a merkle tree node, in bytes.
pub const NODE_SIZE: usize = 32;

/// Filecoin piece or sector data commitment merkle node/root (CommP & CommD)
///
/// Reference: <https://github.com/multiformats/multicodec/blob/master/table.csv>
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;

/// SHA2-256 with the two most significant bits from the last byte zeroed (as
/// via a mask with 0b00111111) - used for proving trees as in Filecoin.
///
/// Reference: <https://github.com/multiformats/multicodec/blob/master/table.csv>
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

/// A 32-byte commitment, the root of the piece's merkle tree.
pub type Commitment = [u8; 32];

#[derive(Debug, Error)]
pub enum CommPError {
    #[error("piece is not a valid size: {0}")]
    InvalidPieceSize(String),

    #[error("failed to wrap commitment into a cid")]
    Cid,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reader that supplements the source with zeroes up to `total_size` bytes.
///
/// Keeps reading from the inner source until it is exhausted and serves
/// zeroes from then on, so a short piece can be hashed as if it filled its
/// whole padded size.
pub struct ZeroPaddingReader<R: Read> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ZeroPaddingReader<R> {
    pub fn new(inner: R, total_size: u64) -> Self {
        Self {
            inner,
            remaining: total_size,
        }
    }
}

impl<R: Read> Read for ZeroPaddingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let to_read = buf.len().min(self.remaining as usize);
        let read = self.inner.read(&mut buf[..to_read])?;
        if read < to_read {
            buf[read..to_read].fill(0);
        }

        self.remaining -= to_read as u64;
        Ok(to_read)
    }
}

/// Smallest padded piece size that fits `size` raw bytes.
///
/// Raw bytes expand by 128/127 to leave room for the two padding bits per
/// node, then round up to the next power of two, with 128 bytes as the
/// minimum piece size.
pub fn padded_piece_size(size: u64) -> u64 {
    let expanded = size.div_ceil(127) * 128;
    expanded.next_power_of_two().max(128)
}

/// Calculate the piece commitment for the given data source.
///
/// `piece_size` must be a power of two, at least 128. The source is
/// zero-padded up to `piece_size` if it runs short.
pub fn calculate_commp<R: Read>(source: R, piece_size: u64) -> Result<Commitment, CommPError> {
    if piece_size < 128 || !piece_size.is_power_of_two() {
        return Err(CommPError::InvalidPieceSize(format!(
            "padded piece size must be a power of two of at least 128 bytes, got {}",
            piece_size
        )));
    }

    let mut source = ZeroPaddingReader::new(source, piece_size);
    let num_leaves = piece_size / NODE_SIZE as u64;

    // Nodes of the partially built tree, one pending node per level. Two
    // nodes on the same level always merge immediately, so the stack depth
    // stays logarithmic in the leaf count.
    let mut stack: Vec<(u32, Commitment)> = Vec::new();
    let mut buffer = [0u8; NODE_SIZE];

    for _ in 0..num_leaves {
        source.read_exact(&mut buffer)?;
        stack.push((0, truncated_hash(&buffer)));

        while stack.len() >= 2 && stack[stack.len() - 2].0 == stack[stack.len() - 1].0 {
            let (level, right) = stack.pop().expect("stack has at least two nodes");
            let (_, left) = stack.pop().expect("stack has at least two nodes");
            stack.push((level + 1, merge_nodes(&left, &right)));
        }
    }

    let (_, root) = stack.pop().expect("piece size yields at least one leaf");
    debug_assert!(stack.is_empty(), "leaf count is a power of two");

    Ok(root)
}

/// Converts a piece commitment to a CID.
pub fn commitment_to_cid(commitment: Commitment) -> Result<Cid, CommPError> {
    let multihash = Multihash::wrap(SHA2_256_TRUNC254_PADDED, &commitment)
        .map_err(|_| CommPError::Cid)?;
    Ok(Cid::new_v1(FIL_COMMITMENT_UNSEALED, multihash))
}

fn truncated_hash(data: &[u8]) -> Commitment {
    let mut hash: Commitment = Sha256::digest(data).into();
    // Zero the two most significant bits so the node fits the field.
    hash[NODE_SIZE - 1] &= 0b0011_1111;
    hash
}

fn merge_nodes(left: &Commitment, right: &Commitment) -> Commitment {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut hash: Commitment = hasher.finalize().into();
    hash[NODE_SIZE - 1] &= 0b0011_1111;
    hash
}
