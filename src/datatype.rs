//! Describing data
//!
//! The core function of the engine is moving bytes that belong to Rust values between
//! processes. This module bridges Rust types and byte layouts:
//!
//! - [`Equivalence`] marks plain-old-data types whose bytes can be sent as they are.
//! - A [`Datatype`] describes a [`Layout`]: which bytes of a buffer take part in a message.
//!   [`SystemDatatype`] covers one value of a primitive type, [`UserDatatype`] builds
//!   contiguous, strided and indexed layouts out of other datatypes.
//! - [`Buffer`] and [`BufferMut`] are implemented by everything that can be sent from or
//!   received into; [`View`] and [`MutView`] apply a datatype to a buffer.
//!
//! Sends pack the layout into a contiguous payload. Receives scatter incoming payload bytes
//! through the layout, so fragments can be written in any order.
//!
//! # Standard section(s)
//!
//! 3.2.2, 4.1
//!
//! # Unfinished features
//!
//! - **4.1.3**: Heterogeneous (struct) datatypes
//! - **4.2**: Pack and unpack

use std::mem;
use std::slice;

use conv::ConvUtil;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::Count;

/// Datatype traits
pub mod traits {
    pub use super::{Buffer, BufferMut, Datatype, Equivalence};
}

/// A type whose values can be sent as their raw bytes.
///
/// # Safety
///
/// Implementors must be plain old data: no padding bytes, no pointers and every bit pattern
/// of the right size must be a valid value, because received bytes are written straight
/// into values of this type.
pub unsafe trait Equivalence: Copy + Send + Sync + 'static {
    /// The datatype describing one value of `Self`
    fn equivalent_datatype() -> SystemDatatype {
        SystemDatatype {
            size: mem::size_of::<Self>(),
        }
    }
}

macro_rules! equivalent_system_datatype {
    ($($rstype:ty),*) => {
        $(unsafe impl Equivalence for $rstype {})*
    }
}

equivalent_system_datatype!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

unsafe impl<T: Equivalence, const N: usize> Equivalence for [T; N] {}

/// A contiguous run of bytes inside a layout
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Byte offset from the start of the buffer
    pub displacement: usize,
    /// Length in bytes
    pub length: usize,
}

/// Which bytes of a buffer make up a message, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    blocks: SmallVec<[Block; 4]>,
    extent: usize,
}

impl Layout {
    /// `len` bytes starting at offset 0
    pub fn contiguous(len: usize) -> Layout {
        let mut blocks = SmallVec::new();
        if len > 0 {
            blocks.push(Block {
                displacement: 0,
                length: len,
            });
        }
        Layout {
            blocks,
            extent: len,
        }
    }

    /// A layout made of `blocks` in the given order, spanning `extent` bytes.
    ///
    /// Adjacent blocks are merged and empty blocks dropped.
    pub fn from_blocks<I: IntoIterator<Item = Block>>(blocks: I, extent: usize) -> Layout {
        let mut merged: SmallVec<[Block; 4]> = SmallVec::new();
        for block in blocks.into_iter().filter(|b| b.length > 0) {
            match merged.last_mut() {
                Some(last) if last.displacement + last.length == block.displacement => {
                    last.length += block.length;
                }
                _ => merged.push(block),
            }
        }
        Layout {
            blocks: merged,
            extent,
        }
    }

    /// Number of bytes that take part in a message
    pub fn size(&self) -> usize {
        self.blocks.iter().map(|b| b.length).sum()
    }

    /// Number of buffer bytes the layout spans
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// The blocks in message order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Whether the message bytes are the first `size()` bytes of the buffer.
    pub fn is_contiguous(&self) -> bool {
        match self.blocks.as_slice() {
            [] => true,
            [only] => only.displacement == 0,
            _ => false,
        }
    }

    /// `count` copies of this layout, each one extent after the previous.
    pub fn repeat(&self, count: usize) -> Layout {
        let blocks = (0..count).flat_map(|i| {
            self.blocks.iter().map(move |b| Block {
                displacement: b.displacement + i * self.extent,
                length: b.length,
            })
        });
        Layout::from_blocks(blocks, self.extent * count)
    }

    fn displaced(&self, by: usize) -> impl Iterator<Item = Block> + '_ {
        self.blocks.iter().map(move |b| Block {
            displacement: b.displacement + by,
            length: b.length,
        })
    }

    /// Gather the message bytes out of `src` into a contiguous payload.
    ///
    /// Blocks that lie beyond the end of `src` contribute only the bytes that exist.
    pub fn pack(&self, src: &[u8]) -> Vec<u8> {
        if self.is_contiguous() {
            return src[..self.size().min(src.len())].to_vec();
        }
        let mut packed = Vec::with_capacity(self.size());
        for block in &self.blocks {
            let start = block.displacement.min(src.len());
            let end = (block.displacement + block.length).min(src.len());
            packed.extend_from_slice(&src[start..end]);
        }
        packed
    }

    /// Write payload bytes that start at message offset `offset` into `dst`.
    ///
    /// Bytes past the layout's size are dropped. Returns how many bytes were written.
    pub fn scatter(&self, offset: usize, data: &[u8], dst: &mut [u8]) -> usize {
        let mut written = 0;
        let mut position = 0;
        let end = offset + data.len();
        for block in &self.blocks {
            let block_end = position + block.length;
            if block_end > offset && position < end {
                let from = offset.max(position);
                let to = end.min(block_end);
                let dst_start = block.displacement + (from - position);
                let dst_end = (dst_start + (to - from)).min(dst.len());
                if dst_start < dst_end {
                    let n = dst_end - dst_start;
                    dst[dst_start..dst_end].copy_from_slice(&data[from - offset..from - offset + n]);
                    written += n;
                }
            }
            position = block_end;
            if position >= end {
                break;
            }
        }
        written
    }
}

/// Something that describes a layout of bytes.
pub trait Datatype {
    /// The layout of one instance
    fn layout(&self) -> Layout;

    /// Bytes per instance that take part in a message
    fn size(&self) -> usize {
        self.layout().size()
    }

    /// Buffer bytes one instance spans
    fn extent(&self) -> usize {
        self.layout().extent()
    }
}

/// The datatype of a single primitive value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SystemDatatype {
    size: usize,
}

impl Datatype for SystemDatatype {
    fn layout(&self) -> Layout {
        Layout::contiguous(self.size)
    }

    fn size(&self) -> usize {
        self.size
    }

    fn extent(&self) -> usize {
        self.size
    }
}

/// A datatype built out of other datatypes.
///
/// # Standard section(s)
///
/// 4.1
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserDatatype {
    layout: Layout,
}

fn non_negative(op: &'static str, count: Count) -> Result<usize> {
    count
        .value_as::<usize>()
        .map_err(|_| Error::InvalidCount {
            op,
            count: count.into(),
        })
}

impl UserDatatype {
    /// `count` instances of `oldtype` back to back.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn contiguous<D: Datatype + ?Sized>(count: Count, oldtype: &D) -> Result<UserDatatype> {
        let count = non_negative("contiguous", count)?;
        Ok(UserDatatype {
            layout: oldtype.layout().repeat(count),
        })
    }

    /// `count` blocks of `blocklength` instances of `oldtype`, block starts `stride`
    /// instances apart.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn vector<D: Datatype + ?Sized>(
        count: Count,
        blocklength: Count,
        stride: Count,
        oldtype: &D,
    ) -> Result<UserDatatype> {
        let count = non_negative("vector", count)?;
        let blocklength = non_negative("vector", blocklength)?;
        let stride = non_negative("vector", stride)?;
        let old = oldtype.layout();
        let step = old.extent();
        let blocks = (0..count).flat_map(|i| {
            let old = &old;
            (0..blocklength).flat_map(move |j| old.displaced((i * stride + j) * step))
        });
        let extent = if count == 0 {
            0
        } else {
            ((count - 1) * stride + blocklength) * step
        };
        let layout = Layout::from_blocks(blocks.collect::<Vec<_>>(), extent);
        Ok(UserDatatype { layout })
    }

    /// Blocks of `blocklengths[i]` instances of `oldtype`, starting `displacements[i]`
    /// instances into the buffer.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn indexed<D: Datatype + ?Sized>(
        blocklengths: &[Count],
        displacements: &[Count],
        oldtype: &D,
    ) -> Result<UserDatatype> {
        if blocklengths.len() != displacements.len() {
            return Err(Error::InvalidArgument {
                op: "indexed",
                reason: format!(
                    "{} block lengths but {} displacements",
                    blocklengths.len(),
                    displacements.len()
                ),
            });
        }
        let old = oldtype.layout();
        let step = old.extent();
        let mut blocks = Vec::new();
        let mut extent = 0;
        for (&length, &displacement) in blocklengths.iter().zip(displacements) {
            let length = non_negative("indexed", length)?;
            let displacement = non_negative("indexed", displacement)?;
            for j in 0..length {
                blocks.extend(old.displaced((displacement + j) * step));
            }
            extent = extent.max((displacement + length) * step);
        }
        Ok(UserDatatype {
            layout: Layout::from_blocks(blocks, extent),
        })
    }
}

impl Datatype for UserDatatype {
    fn layout(&self) -> Layout {
        self.layout.clone()
    }
}

/// Something that can be sent from.
pub trait Buffer {
    /// The bytes the layout refers into
    fn as_bytes(&self) -> &[u8];

    /// Which of those bytes make up the message
    fn layout(&self) -> Layout;
}

/// Something that can be received into.
pub trait BufferMut: Buffer {
    /// The bytes the layout refers into
    fn as_bytes_mut(&mut self) -> &mut [u8];
}

fn bytes_of<T: Equivalence>(values: &[T]) -> &[u8] {
    // SAFETY: `Equivalence` types are plain old data without padding.
    unsafe { slice::from_raw_parts(values.as_ptr().cast::<u8>(), mem::size_of_val(values)) }
}

fn bytes_of_mut<T: Equivalence>(values: &mut [T]) -> &mut [u8] {
    // SAFETY: `Equivalence` types accept every bit pattern.
    unsafe {
        slice::from_raw_parts_mut(values.as_mut_ptr().cast::<u8>(), mem::size_of_val(values))
    }
}

impl<T: Equivalence> Buffer for T {
    fn as_bytes(&self) -> &[u8] {
        bytes_of(slice::from_ref(self))
    }

    fn layout(&self) -> Layout {
        Layout::contiguous(mem::size_of::<T>())
    }
}

impl<T: Equivalence> BufferMut for T {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytes_of_mut(slice::from_mut(self))
    }
}

impl<T: Equivalence> Buffer for [T] {
    fn as_bytes(&self) -> &[u8] {
        bytes_of(self)
    }

    fn layout(&self) -> Layout {
        Layout::contiguous(mem::size_of_val(self))
    }
}

impl<T: Equivalence> BufferMut for [T] {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytes_of_mut(self)
    }
}

fn check_extent(op: &'static str, len: usize, layout: &Layout) -> Result<()> {
    if layout.extent() > len {
        return Err(Error::InvalidBuffer {
            op,
            len,
            extent: layout.extent(),
        });
    }
    Ok(())
}

/// A buffer seen through a datatype.
///
/// # Examples
///
/// ```
/// use mpi_ptp::datatype::{Buffer, Equivalence, UserDatatype, View};
///
/// let data = [1u16, 2, 3, 4, 5, 6];
/// let every_other = UserDatatype::vector(3, 1, 2, &u16::equivalent_datatype()).unwrap();
/// let view = View::with_count_and_datatype(&data[..], 1, &every_other).unwrap();
/// assert_eq!(view.layout().size(), 6);
/// ```
pub struct View<'d, 'b, D: Datatype, T: Equivalence> {
    datatype: &'d D,
    buffer: &'b [T],
    count: usize,
}

impl<'d, 'b, D: Datatype, T: Equivalence> View<'d, 'b, D, T> {
    /// `count` instances of `datatype` laid over `buffer`. Fails if they do not fit.
    pub fn with_count_and_datatype(
        buffer: &'b [T],
        count: usize,
        datatype: &'d D,
    ) -> Result<View<'d, 'b, D, T>> {
        let view = View {
            datatype,
            buffer,
            count,
        };
        check_extent("view", mem::size_of_val(buffer), &view.layout())?;
        Ok(view)
    }
}

impl<'d, 'b, D: Datatype, T: Equivalence> Buffer for View<'d, 'b, D, T> {
    fn as_bytes(&self) -> &[u8] {
        bytes_of(self.buffer)
    }

    fn layout(&self) -> Layout {
        self.datatype.layout().repeat(self.count)
    }
}

/// A mutable buffer seen through a datatype.
pub struct MutView<'d, 'b, D: Datatype, T: Equivalence> {
    datatype: &'d D,
    buffer: &'b mut [T],
    count: usize,
}

impl<'d, 'b, D: Datatype, T: Equivalence> MutView<'d, 'b, D, T> {
    /// `count` instances of `datatype` laid over `buffer`. Fails if they do not fit.
    pub fn with_count_and_datatype(
        buffer: &'b mut [T],
        count: usize,
        datatype: &'d D,
    ) -> Result<MutView<'d, 'b, D, T>> {
        let len = mem::size_of_val(buffer);
        let view = MutView {
            datatype,
            buffer,
            count,
        };
        check_extent("view", len, &view.layout())?;
        Ok(view)
    }
}

impl<'d, 'b, D: Datatype, T: Equivalence> Buffer for MutView<'d, 'b, D, T> {
    fn as_bytes(&self) -> &[u8] {
        bytes_of(self.buffer)
    }

    fn layout(&self) -> Layout {
        self.datatype.layout().repeat(self.count)
    }
}

impl<'d, 'b, D: Datatype, T: Equivalence> BufferMut for MutView<'d, 'b, D, T> {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytes_of_mut(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_layout() {
        let layout = UserDatatype::vector(3, 2, 4, &u8::equivalent_datatype())
            .unwrap()
            .layout();
        assert_eq!(
            layout.blocks(),
            &[
                Block { displacement: 0, length: 2 },
                Block { displacement: 4, length: 2 },
                Block { displacement: 8, length: 2 },
            ]
        );
        assert_eq!(layout.size(), 6);
        assert_eq!(layout.extent(), 10);
    }

    #[test]
    fn indexed_layout_in_element_units() {
        let layout = UserDatatype::indexed(&[1, 2], &[3, 0], &u32::equivalent_datatype())
            .unwrap()
            .layout();
        assert_eq!(
            layout.blocks(),
            &[
                Block { displacement: 12, length: 4 },
                Block { displacement: 0, length: 8 },
            ]
        );
        assert_eq!(layout.extent(), 16);
    }

    #[test]
    fn negative_counts_are_rejected() {
        let err = UserDatatype::contiguous(-1, &u8::equivalent_datatype()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Count);
    }

    #[test]
    fn pack_and_scatter_in_pieces() {
        let layout = UserDatatype::vector(3, 2, 3, &u8::equivalent_datatype())
            .unwrap()
            .layout();
        let src = [1u8, 2, 0, 3, 4, 0, 5, 6];
        assert_eq!(layout.pack(&src), vec![1, 2, 3, 4, 5, 6]);

        let mut dst = [9u8; 8];
        assert_eq!(layout.scatter(3, &[4, 5, 6], &mut dst), 3);
        assert_eq!(layout.scatter(0, &[1, 2, 3], &mut dst), 3);
        assert_eq!(dst, [1, 2, 9, 3, 4, 9, 5, 6]);
    }

    #[test]
    fn scatter_clips_at_layout_size() {
        let layout = Layout::contiguous(4);
        let mut dst = [0u8; 6];
        assert_eq!(layout.scatter(2, &[1, 2, 3, 4], &mut dst), 2);
        assert_eq!(dst, [0, 0, 1, 2, 0, 0]);
        assert_eq!(layout.scatter(4, &[7], &mut dst), 0);
    }

    #[test]
    fn views_must_fit_their_buffer() {
        let data = [0u32; 4];
        let pair = UserDatatype::contiguous(2, &u32::equivalent_datatype()).unwrap();
        assert!(View::with_count_and_datatype(&data[..], 2, &pair).is_ok());
        let err = View::with_count_and_datatype(&data[..], 3, &pair).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Buffer);
    }

    #[test]
    fn buffers_expose_their_bytes() {
        let value = 0x0102_0304u32;
        assert_eq!(value.as_bytes(), &value.to_ne_bytes());
        let mut values = [0u16; 2];
        values[..].as_bytes_mut().copy_from_slice(&[1, 0, 1, 0]);
        assert_eq!(values, [u16::from_ne_bytes([1, 0]); 2]);
    }
}
