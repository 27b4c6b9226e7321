//! Labels and deferred jump-target resolution.
//!
//! Jump and RIP-relative targets are frequently unknown when the referencing
//! instruction is emitted (forward branches, constant pools behind the
//! epilogue). The [`JumpTable`] records a pending call site for every such
//! reference and patches all of them in one pass once every label has been
//! placed, which keeps instruction encoders single-pass: they always just
//! emit, never compute distances.

use crate::core::error::{JitError, JitResult};

/// Opaque handle for a jump/branch target whose final offset is resolved
/// after emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    /// Numeric identifier, used in error reporting.
    pub fn id(self) -> u32 {
        self.0
    }
}

/// A recorded buffer location whose operand bytes must be rewritten once its
/// label resolves.
#[derive(Debug, Clone, Copy)]
struct CallSite {
    label: Label,
    /// Buffer offset of the first operand byte.
    offset: u32,
    /// Operand width in bytes: 1, 4, or 8.
    size: u8,
}

/// Write-once map from label to resolved offset plus the list of pending
/// patch records. Decoupled from instruction semantics so any encoder can
/// reuse it unchanged.
pub struct JumpTable {
    /// Placement offset per allocated label, `None` until placed.
    placements: Vec<Option<u32>>,
    call_sites: Vec<CallSite>,
    max_labels: usize,
    max_call_sites: usize,
}

impl JumpTable {
    pub fn new(max_labels: usize, max_call_sites: usize) -> Self {
        Self {
            placements: Vec::with_capacity(max_labels),
            call_sites: Vec::with_capacity(max_call_sites),
            max_labels,
            max_call_sites,
        }
    }

    /// Reserve the next label identifier.
    pub fn allocate_label(&mut self) -> JitResult<Label> {
        if self.placements.len() >= self.max_labels {
            return Err(JitError::LabelCapacity {
                max: self.max_labels,
            });
        }
        let label = Label(self.placements.len() as u32);
        self.placements.push(None);
        Ok(label)
    }

    /// Bind `label` to a concrete buffer offset. Each label may be placed
    /// exactly once.
    pub fn place_label(&mut self, label: Label, offset: u32) -> JitResult<()> {
        let slot = self
            .placements
            .get_mut(label.0 as usize)
            .ok_or(JitError::InvalidLabel { id: label.0 })?;
        if slot.is_some() {
            return Err(JitError::LabelAlreadyPlaced { id: label.0 });
        }
        *slot = Some(offset);
        Ok(())
    }

    /// Offset a label was placed at, if it has been placed.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.placements.get(label.0 as usize).copied().flatten()
    }

    /// Record a pending reference of `size` bytes at `offset`.
    pub fn add_call_site(&mut self, label: Label, offset: u32, size: u8) -> JitResult<()> {
        if !matches!(size, 1 | 4 | 8) {
            return Err(JitError::InvalidCallSiteWidth { size });
        }
        if (label.0 as usize) >= self.placements.len() {
            return Err(JitError::InvalidLabel { id: label.0 });
        }
        if self.call_sites.len() >= self.max_call_sites {
            return Err(JitError::CallSiteCapacity {
                max: self.max_call_sites,
            });
        }
        self.call_sites.push(CallSite {
            label,
            offset,
            size,
        });
        Ok(())
    }

    /// Rewrite every recorded call site in `buf` with the signed relative
    /// offset `placed − site_offset − size`.
    ///
    /// Fails if any referenced label was never placed or an offset does not
    /// fit its recorded field width. On failure the buffer must be
    /// considered invalid; no partially patched code may be executed.
    pub fn patch(&self, buf: &mut [u8]) -> JitResult<()> {
        for site in &self.call_sites {
            let target = self.placements[site.label.0 as usize]
                .ok_or(JitError::UnplacedLabel { id: site.label.0 })?;
            let rel = i64::from(target) - i64::from(site.offset) - i64::from(site.size);
            let fits = match site.size {
                1 => i8::try_from(rel).is_ok(),
                4 => i32::try_from(rel).is_ok(),
                _ => true,
            };
            if !fits {
                return Err(JitError::OffsetOutOfRange {
                    offset: rel,
                    size: site.size,
                });
            }
            let start = site.offset as usize;
            let bytes = rel.to_le_bytes();
            buf[start..start + site.size as usize].copy_from_slice(&bytes[..site.size as usize]);
        }
        Ok(())
    }

    /// Drop placements and call sites at or past `offset`, for speculative
    /// re-emission after a buffer rewind. Label identifiers stay allocated.
    pub fn rewind(&mut self, offset: u32) {
        for slot in &mut self.placements {
            if matches!(slot, Some(o) if *o >= offset) {
                *slot = None;
            }
        }
        self.call_sites.retain(|site| site.offset < offset);
    }

    /// Number of labels allocated so far.
    pub fn label_count(&self) -> usize {
        self.placements.len()
    }

    /// Number of call sites recorded so far.
    pub fn call_site_count(&self) -> usize {
        self.call_sites.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_writes_relative_offset() {
        let mut table = JumpTable::new(4, 4);
        let label = table.allocate_label().unwrap();

        // Reference at offset 2, 4 bytes wide; label placed at offset 16.
        table.add_call_site(label, 2, 4).unwrap();
        table.place_label(label, 16).unwrap();

        let mut buf = [0u8; 32];
        table.patch(&mut buf).unwrap();

        let rel = i32::from_le_bytes(buf[2..6].try_into().unwrap());
        assert_eq!(rel, 16 - 2 - 4);
    }

    #[test]
    fn test_backward_reference_is_negative() {
        let mut table = JumpTable::new(4, 4);
        let label = table.allocate_label().unwrap();

        table.place_label(label, 0).unwrap();
        table.add_call_site(label, 10, 4).unwrap();

        let mut buf = [0u8; 32];
        table.patch(&mut buf).unwrap();

        let rel = i32::from_le_bytes(buf[10..14].try_into().unwrap());
        assert_eq!(rel, -14);
    }

    #[test]
    fn test_label_placed_twice_fails() {
        let mut table = JumpTable::new(4, 4);
        let label = table.allocate_label().unwrap();

        table.place_label(label, 0).unwrap();
        assert_eq!(
            table.place_label(label, 8),
            Err(JitError::LabelAlreadyPlaced { id: label.id() })
        );
    }

    #[test]
    fn test_unplaced_label_fails_patch() {
        let mut table = JumpTable::new(4, 4);
        let label = table.allocate_label().unwrap();
        table.add_call_site(label, 0, 4).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(
            table.patch(&mut buf),
            Err(JitError::UnplacedLabel { id: label.id() })
        );
    }

    #[test]
    fn test_rel8_overflow_fails_patch() {
        let mut table = JumpTable::new(4, 4);
        let label = table.allocate_label().unwrap();

        // A 1-byte field can hold at most +127; distance here is 200 - 1.
        table.add_call_site(label, 0, 1).unwrap();
        table.place_label(label, 200).unwrap();

        let mut buf = [0u8; 256];
        assert!(matches!(
            table.patch(&mut buf),
            Err(JitError::OffsetOutOfRange { size: 1, .. })
        ));
    }

    #[test]
    fn test_label_capacity() {
        let mut table = JumpTable::new(2, 2);
        table.allocate_label().unwrap();
        table.allocate_label().unwrap();
        assert_eq!(
            table.allocate_label(),
            Err(JitError::LabelCapacity { max: 2 })
        );
    }

    #[test]
    fn test_call_site_capacity() {
        let mut table = JumpTable::new(4, 1);
        let label = table.allocate_label().unwrap();
        table.add_call_site(label, 0, 4).unwrap();
        assert_eq!(
            table.add_call_site(label, 8, 4),
            Err(JitError::CallSiteCapacity { max: 1 })
        );
    }

    #[test]
    fn test_rewind_drops_later_records() {
        let mut table = JumpTable::new(4, 4);
        let a = table.allocate_label().unwrap();
        let b = table.allocate_label().unwrap();

        table.place_label(a, 4).unwrap();
        table.place_label(b, 20).unwrap();
        table.add_call_site(a, 8, 4).unwrap();
        table.add_call_site(b, 24, 4).unwrap();

        table.rewind(16);

        assert_eq!(table.label_offset(a), Some(4));
        assert_eq!(table.label_offset(b), None);
        assert_eq!(table.call_site_count(), 1);

        // The rewound label can be placed again.
        table.place_label(b, 12).unwrap();
        assert_eq!(table.label_offset(b), Some(12));
    }

    #[test]
    fn test_eight_byte_sites_never_overflow() {
        let mut table = JumpTable::new(1, 1);
        let label = table.allocate_label().unwrap();
        table.add_call_site(label, 0, 8).unwrap();
        table.place_label(label, 1000).unwrap();

        let mut buf = [0u8; 1024];
        table.patch(&mut buf).unwrap();
        let rel = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        assert_eq!(rel, 1000 - 8);
    }
}
