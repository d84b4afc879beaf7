// SPDX-License-Identifier: Apache-2.0

//! Implementation of [`ExtentStreamCursor`].

use crate::image::{ImageFormatError, PrepError, extents::ExtentChain, layout};
use core::mem;

/// Persistable position of an [`ExtentStreamCursor`].
///
/// The position is recorded relative to the chain structure, as the extent's
/// ordinal within its chain plus a block offset into it, not as an absolute
/// block index. Re-reading the chains from the image header reproduces the
/// exact same extent sequence, so a position saved before a reboot stays
/// valid against the rebuilt chains on resume.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SavedCursorPos {
    /// The chain the cursor stood in, `None` for a cursor at its initial
    /// position.
    chain: Option<u32>,
    /// Ordinal of the extent within the chain.
    extent: u32,
    /// Block offset within the extent.
    offset: u64,
}

impl SavedCursorPos {
    /// The initial position, i.e. before the first block.
    pub const fn start() -> Self {
        Self {
            chain: None,
            extent: 0,
            offset: 0,
        }
    }

    pub const fn encoded_len() -> usize {
        mem::size_of::<i32>() + mem::size_of::<u32>() + mem::size_of::<u64>()
    }

    pub fn encode(&self) -> [u8; Self::encoded_len()] {
        let chain = match self.chain {
            Some(chain) => chain as i32,
            None => -1,
        };
        let mut result = [0u8; Self::encoded_len()];
        result[..4].copy_from_slice(&chain.to_le_bytes());
        result[4..8].copy_from_slice(&self.extent.to_le_bytes());
        result[8..].copy_from_slice(&self.offset.to_le_bytes());
        result
    }

    pub fn decode(buf: &[u8; Self::encoded_len()]) -> Result<Self, PrepError> {
        let chain = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let extent = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let offset = u64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        let chain = match chain {
            -1 => None,
            c if c >= 0 => Some(c as u32),
            _ => return Err(PrepError::from(ImageFormatError::InvalidCursorRecord)),
        };
        Ok(Self { chain, extent, offset })
    }
}

#[derive(Clone, Copy)]
enum Position {
    /// Before the first block of the first chain.
    BeforeStart,
    /// At a block, the one most recently yielded by
    /// [`advance()`](ExtentStreamCursor::advance).
    At {
        chain: usize,
        extent: usize,
        offset: u64,
    },
    /// Past the last block of the last chain.
    End,
}

/// Linear iteration over the blocks of a sequence of [`ExtentChain`]s.
///
/// The writer and the reader of an image walk the same chain sequence with
/// this cursor, which is what makes block addresses implicit: the n-th page
/// streamed out always lands in the n-th block of the walk, on both sides.
pub struct ExtentStreamCursor<'a> {
    chains: &'a [&'a ExtentChain],
    pos: Position,
}

impl<'a> ExtentStreamCursor<'a> {
    pub fn new(chains: &'a [&'a ExtentChain]) -> Self {
        Self {
            chains,
            pos: Position::BeforeStart,
        }
    }

    /// Return to the initial position, before the first block.
    pub fn reset(&mut self) {
        self.pos = Position::BeforeStart;
    }

    /// Move to the next block and return its device block index, or `None`
    /// once all chains are exhausted.
    pub fn advance(&mut self) -> Option<layout::DeviceBlockIndex> {
        let next = match self.pos {
            Position::BeforeStart => Self::first_from(self.chains, 0),
            Position::At { chain, extent, offset } => match self.chains[chain].get(extent) {
                Some(cur) => {
                    if offset + 1 < u64::from(cur.block_count()) {
                        Some((chain, extent, offset + 1))
                    } else if extent + 1 < self.chains[chain].len() {
                        Some((chain, extent + 1, 0))
                    } else {
                        Self::first_from(self.chains, chain + 1)
                    }
                }
                None => {
                    debug_assert!(false, "cursor position off its chain");
                    None
                }
            },
            Position::End => None,
        };

        match next {
            Some((chain, extent, offset)) => {
                self.pos = Position::At { chain, extent, offset };
                self.chains[chain]
                    .get(extent)
                    .map(|e| layout::DeviceBlockIndex::from(u64::from(e.first()) + offset))
            }
            None => {
                self.pos = Position::End;
                None
            }
        }
    }

    /// Record the current position for persisting in the image header.
    ///
    /// An exhausted cursor saves as the initial position; a complete walk
    /// needs no resumption and restarting one is the conservative choice.
    pub fn save(&self) -> SavedCursorPos {
        match self.pos {
            Position::At { chain, extent, offset } => SavedCursorPos {
                chain: Some(chain as u32),
                extent: extent as u32,
                offset,
            },
            Position::BeforeStart | Position::End => SavedCursorPos::start(),
        }
    }

    /// Reposition onto a previously [saved](Self::save) position.
    ///
    /// The position is validated against the chains the cursor walks; a
    /// position pointing outside them means the header and the chains
    /// disagree structurally.
    pub fn restore(&mut self, saved: &SavedCursorPos) -> Result<(), PrepError> {
        match saved.chain {
            None => {
                self.pos = Position::BeforeStart;
                Ok(())
            }
            Some(chain) => {
                let chain = chain as usize;
                let extent = saved.extent as usize;
                let e = self
                    .chains
                    .get(chain)
                    .and_then(|c| c.get(extent))
                    .ok_or(PrepError::StructuralInconsistency)?;
                if saved.offset >= u64::from(e.block_count()) {
                    return Err(PrepError::StructuralInconsistency);
                }
                self.pos = Position::At {
                    chain,
                    extent,
                    offset: saved.offset,
                };
                Ok(())
            }
        }
    }

    fn first_from(chains: &[&ExtentChain], from_chain: usize) -> Option<(usize, usize, u64)> {
        (from_chain..chains.len())
            .find(|&chain| !chains[chain].is_empty())
            .map(|chain| (chain, 0, 0))
    }
}

#[cfg(test)]
fn test_chain(extents: &[(u64, u64)]) -> ExtentChain {
    let mut chain = ExtentChain::new();
    for e in extents {
        chain.insert(layout::DeviceBlockRange::from(*e)).unwrap();
    }
    chain
}

#[test]
fn walk_ends_and_resumes_across_extents() {
    let chain = test_chain(&[(0, 9), (20, 29)]);
    let chains = [&chain];
    let mut cursor = ExtentStreamCursor::new(&chains);

    for expected in 0..=9u64 {
        assert_eq!(cursor.advance(), Some(layout::DeviceBlockIndex::from(expected)));
    }
    assert_eq!(cursor.advance(), Some(layout::DeviceBlockIndex::from(20)));
    for expected in 21..=29u64 {
        assert_eq!(cursor.advance(), Some(layout::DeviceBlockIndex::from(expected)));
    }
    assert_eq!(cursor.advance(), None);
    assert_eq!(cursor.advance(), None);
}

#[test]
fn walk_spans_chains_and_skips_empty() {
    let first = test_chain(&[(5, 6)]);
    let empty = test_chain(&[]);
    let last = test_chain(&[(100, 100)]);
    let chains = [&first, &empty, &last];
    let mut cursor = ExtentStreamCursor::new(&chains);

    assert_eq!(cursor.advance(), Some(layout::DeviceBlockIndex::from(5)));
    assert_eq!(cursor.advance(), Some(layout::DeviceBlockIndex::from(6)));
    assert_eq!(cursor.advance(), Some(layout::DeviceBlockIndex::from(100)));
    assert_eq!(cursor.advance(), None);
}

#[test]
fn save_restore_mid_walk() {
    let first = test_chain(&[(0, 2)]);
    let last = test_chain(&[(10, 11)]);
    let chains = [&first, &last];

    let mut cursor = ExtentStreamCursor::new(&chains);
    for _ in 0..4 {
        cursor.advance();
    }
    let saved = cursor.save();

    // Decode/encode and restore against freshly built chains.
    let saved = SavedCursorPos::decode(&saved.encode()).unwrap();
    let first = test_chain(&[(0, 2)]);
    let last = test_chain(&[(10, 11)]);
    let chains = [&first, &last];
    let mut cursor = ExtentStreamCursor::new(&chains);
    cursor.restore(&saved).unwrap();
    assert_eq!(cursor.advance(), Some(layout::DeviceBlockIndex::from(11)));
    assert_eq!(cursor.advance(), None);
}

#[test]
fn exhausted_cursor_saves_as_start() {
    let chain = test_chain(&[(0, 0)]);
    let chains = [&chain];
    let mut cursor = ExtentStreamCursor::new(&chains);
    assert_eq!(cursor.save(), SavedCursorPos::start());
    cursor.advance();
    cursor.advance();
    assert_eq!(cursor.save(), SavedCursorPos::start());
}

#[test]
fn restore_rejects_stale_position() {
    let chain = test_chain(&[(0, 4)]);
    let chains = [&chain];
    let mut cursor = ExtentStreamCursor::new(&chains);

    let saved = SavedCursorPos {
        chain: Some(0),
        extent: 1,
        offset: 0,
    };
    assert_eq!(cursor.restore(&saved), Err(PrepError::StructuralInconsistency));
    let saved = SavedCursorPos {
        chain: Some(0),
        extent: 0,
        offset: 5,
    };
    assert_eq!(cursor.restore(&saved), Err(PrepError::StructuralInconsistency));
}
