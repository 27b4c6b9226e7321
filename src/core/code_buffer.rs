//! Patchable instruction buffer.
//!
//! [`CodeBuffer`] is a fixed-capacity little-endian byte buffer with a write
//! cursor, composed with a [`JumpTable`] for deferred jump-target
//! resolution. Instruction encoders emit scalars and raw bytes at the
//! cursor and record call sites for label operands; `patch_call_sites`
//! rewrites every recorded reference once all labels are placed.
//!
//! The backing store is allocated once at construction and never grows; a
//! compile that outruns it fails with a capacity error rather than
//! reallocating mid-emission.

use crate::core::error::{JitError, JitResult};
use crate::core::jump_table::{JumpTable, Label};

/// Byte used for alignment padding (x86 `int3`, traps if ever executed).
const PAD_BYTE: u8 = 0xcc;

/// Fixed-width scalar that can be emitted in little-endian byte order.
pub trait EmitScalar: Copy {
    const SIZE: usize;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_emit_scalar {
    ($($ty:ty),*) => {
        $(impl EmitScalar for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            fn write_le(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        })*
    };
}

impl_emit_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// The patchable instruction stream.
pub struct CodeBuffer {
    bytes: Box<[u8]>,
    position: usize,
    jump_table: JumpTable,
}

impl CodeBuffer {
    /// Allocate a buffer of `capacity` bytes configured for at most
    /// `max_labels` labels and `max_call_sites` pending references.
    pub fn new(capacity: usize, max_labels: usize, max_call_sites: usize) -> JitResult<Self> {
        if capacity == 0 {
            return Err(JitError::ZeroCapacity);
        }
        Ok(Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            jump_table: JumpTable::new(max_labels, max_call_sites),
        })
    }

    /// Offset of the current write position.
    pub fn current_position(&self) -> usize {
        self.position
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes emitted so far.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.position]
    }

    fn check_room(&self, requested: usize) -> JitResult<()> {
        if self.position + requested > self.bytes.len() {
            return Err(JitError::BufferOverflow {
                position: self.position,
                requested,
                capacity: self.bytes.len(),
            });
        }
        Ok(())
    }

    /// Write a scalar's bytes in little-endian order and advance the cursor.
    pub fn emit_value<T: EmitScalar>(&mut self, value: T) -> JitResult<()> {
        self.check_room(T::SIZE)?;
        value.write_le(&mut self.bytes[self.position..]);
        self.position += T::SIZE;
        Ok(())
    }

    pub fn emit8(&mut self, value: u8) -> JitResult<()> {
        self.emit_value(value)
    }

    pub fn emit16(&mut self, value: u16) -> JitResult<()> {
        self.emit_value(value)
    }

    pub fn emit32(&mut self, value: u32) -> JitResult<()> {
        self.emit_value(value)
    }

    pub fn emit64(&mut self, value: u64) -> JitResult<()> {
        self.emit_value(value)
    }

    /// Write a raw byte range at the cursor.
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> JitResult<()> {
        self.check_room(bytes.len())?;
        self.bytes[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    /// Rewind the cursor to `position` without reallocating, dropping any
    /// label placements and call sites recorded at or past it. Enables
    /// re-emission after a size-estimation miss.
    pub fn reset(&mut self, position: usize) -> JitResult<()> {
        if position > self.bytes.len() {
            return Err(JitError::InvalidPosition {
                position,
                capacity: self.bytes.len(),
            });
        }
        self.position = position;
        self.jump_table.rewind(position as u32);
        Ok(())
    }

    /// Advance the cursor by `count` bytes, returning the offset before
    /// advancing. The skipped bytes keep their current contents.
    pub fn advance(&mut self, count: usize) -> JitResult<usize> {
        self.check_room(count)?;
        let start = self.position;
        self.position += count;
        Ok(start)
    }

    /// Emit padding until the cursor is aligned to `align` bytes.
    pub fn align_to(&mut self, align: usize) -> JitResult<()> {
        debug_assert!(align.is_power_of_two());
        while self.position % align != 0 {
            self.emit8(PAD_BYTE)?;
        }
        Ok(())
    }

    /// Overwrite `length` bytes starting at `start` with `value`. Does not
    /// move the cursor.
    pub fn fill(&mut self, start: usize, length: usize, value: u8) -> JitResult<()> {
        if start + length > self.bytes.len() {
            return Err(JitError::BufferOverflow {
                position: start,
                requested: length,
                capacity: self.bytes.len(),
            });
        }
        self.bytes[start..start + length].fill(value);
        Ok(())
    }

    /// Reserve the next label identifier.
    pub fn allocate_label(&mut self) -> JitResult<Label> {
        self.jump_table.allocate_label()
    }

    /// Bind `label` to the current write position.
    pub fn place_label(&mut self, label: Label) -> JitResult<()> {
        self.jump_table.place_label(label, self.position as u32)
    }

    /// Offset a label was placed at, if any.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.jump_table.label_offset(label)
    }

    /// Record a pending `size`-byte reference to `label` at the cursor and
    /// reserve (zero-fill) that many bytes.
    ///
    /// Only instruction encoders call this; the reserved bytes are operand
    /// fields whose layout the encoder controls.
    pub(crate) fn emit_call_site(&mut self, label: Label, size: u8) -> JitResult<()> {
        self.check_room(size as usize)?;
        self.jump_table
            .add_call_site(label, self.position as u32, size)?;
        for _ in 0..size {
            self.emit8(0)?;
        }
        Ok(())
    }

    /// Patch every recorded call site with the relative offset to its
    /// label's placed position. Invoked as the last step of emission; a
    /// failure invalidates the whole buffer.
    pub fn patch_call_sites(&mut self) -> JitResult<()> {
        self.jump_table.patch(&mut self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> CodeBuffer {
        CodeBuffer::new(64, 8, 8).unwrap()
    }

    #[test]
    fn test_scalar_emission_is_little_endian() {
        let mut buf = buffer();
        buf.emit8(0x11).unwrap();
        buf.emit16(0x2233).unwrap();
        buf.emit32(0x4455_6677).unwrap();
        buf.emit64(0x8899_aabb_ccdd_eeff).unwrap();

        assert_eq!(
            buf.bytes(),
            &[
                0x11, 0x33, 0x22, 0x77, 0x66, 0x55, 0x44, 0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa,
                0x99, 0x88
            ]
        );
        assert_eq!(buf.current_position(), 15);
    }

    #[test]
    fn test_emit_value_f64_round_trips() {
        let mut buf = buffer();
        buf.emit_value(123.456f64).unwrap();
        let back = f64::from_le_bytes(buf.bytes()[0..8].try_into().unwrap());
        assert_eq!(back, 123.456);
    }

    #[test]
    fn test_overflow_detected_before_write() {
        let mut buf = CodeBuffer::new(4, 1, 1).unwrap();
        buf.emit32(1).unwrap();
        let err = buf.emit8(0xff).unwrap_err();
        assert_eq!(
            err,
            JitError::BufferOverflow {
                position: 4,
                requested: 1,
                capacity: 4,
            }
        );
        // Nothing was written and the cursor did not move.
        assert_eq!(buf.current_position(), 4);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            CodeBuffer::new(0, 1, 1).err(),
            Some(JitError::ZeroCapacity)
        );
    }

    #[test]
    fn test_align_and_fill() {
        let mut buf = buffer();
        buf.emit8(1).unwrap();
        buf.align_to(8).unwrap();
        assert_eq!(buf.current_position(), 8);
        assert_eq!(&buf.bytes()[1..8], &[PAD_BYTE; 7]);

        buf.fill(1, 7, 0).unwrap();
        assert_eq!(&buf.bytes()[1..8], &[0u8; 7]);
    }

    #[test]
    fn test_advance_returns_previous_position() {
        let mut buf = buffer();
        buf.emit32(0).unwrap();
        assert_eq!(buf.advance(8).unwrap(), 4);
        assert_eq!(buf.current_position(), 12);
    }

    #[test]
    fn test_reset_rewinds_cursor_and_jump_table() {
        let mut buf = buffer();
        let label = buf.allocate_label().unwrap();
        buf.emit32(0xdead_beef).unwrap();
        buf.emit_call_site(label, 4).unwrap();
        buf.place_label(label).unwrap();

        buf.reset(4).unwrap();
        assert_eq!(buf.current_position(), 4);
        assert_eq!(buf.label_offset(label), None);

        // Re-emission resolves cleanly after the rewind.
        buf.emit_call_site(label, 4).unwrap();
        buf.place_label(label).unwrap();
        buf.patch_call_sites().unwrap();
    }

    #[test]
    fn test_call_site_reserves_zeroed_bytes() {
        let mut buf = buffer();
        let label = buf.allocate_label().unwrap();
        buf.emit8(0xe9).unwrap();
        buf.emit_call_site(label, 4).unwrap();
        assert_eq!(buf.current_position(), 5);
        assert_eq!(&buf.bytes()[1..5], &[0, 0, 0, 0]);

        buf.place_label(label).unwrap();
        buf.patch_call_sites().unwrap();
        // Target is the label at offset 5: rel = 5 - 1 - 4 = 0.
        assert_eq!(&buf.bytes()[1..5], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_patch_after_forward_reference() {
        let mut buf = buffer();
        let label = buf.allocate_label().unwrap();
        buf.emit8(0xe9).unwrap();
        buf.emit_call_site(label, 4).unwrap();
        buf.emit_bytes(&[0x90; 11]).unwrap();
        buf.place_label(label).unwrap();
        buf.patch_call_sites().unwrap();

        let rel = i32::from_le_bytes(buf.bytes()[1..5].try_into().unwrap());
        assert_eq!(rel, 11);
    }

    #[test]
    fn test_finalize_with_unplaced_label_fails() {
        let mut buf = buffer();
        let label = buf.allocate_label().unwrap();
        buf.emit_call_site(label, 4).unwrap();
        assert_eq!(
            buf.patch_call_sites(),
            Err(JitError::UnplacedLabel { id: label.id() })
        );
    }
}
