//! Physical register identifiers and per-bank free lists.
//!
//! General-purpose and vector registers live in disjoint banks from the
//! start; the allocator draws from one [`RegisterPool`] per bank and can
//! never hand a floating-point value a general-purpose register or vice
//! versa.

/// Bank index for 64-bit general-purpose registers.
pub const BANK_GP: u8 = 0;
/// Bank index for XMM vector registers.
pub const BANK_XMM: u8 = 1;

const NUM_BANKS: usize = 2;

/// Combined register identifier. `id` is the hardware encoding within the
/// bank (0 = RAX / XMM0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: u8,
    pub id: u8,
}

impl AsmReg {
    pub const fn new(bank: u8, id: u8) -> Self {
        Self { bank, id }
    }

    /// Low three bits of the hardware encoding (ModRM field).
    pub fn low_bits(self) -> u8 {
        self.id & 0x07
    }

    /// Whether the register needs a REX extension bit (r8-r15, xmm8-xmm15).
    pub fn needs_rex_ext(self) -> bool {
        self.id >= 8
    }
}

/// Bit set over both register banks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    banks: [u16; NUM_BANKS],
}

impl RegBitSet {
    pub const fn new() -> Self {
        Self {
            banks: [0; NUM_BANKS],
        }
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        (self.banks[reg.bank as usize] & (1 << reg.id)) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        self.banks[reg.bank as usize] |= 1 << reg.id;
    }

    pub fn clear(&mut self, reg: AsmReg) {
        self.banks[reg.bank as usize] &= !(1 << reg.id);
    }

    /// Lowest-numbered register set in `bank`, if any.
    pub fn first_in_bank(&self, bank: u8) -> Option<AsmReg> {
        let bits = self.banks[bank as usize];
        if bits == 0 {
            return None;
        }
        Some(AsmReg::new(bank, bits.trailing_zeros() as u8))
    }

    pub fn count_in_bank(&self, bank: u8) -> u32 {
        self.banks[bank as usize].count_ones()
    }
}

/// Free list of allocatable registers across both banks.
///
/// The Sethi-Ullman pass frees registers deterministically at each value's
/// last use, so the pool needs no eviction machinery: allocation either
/// succeeds or the caller spills.
#[derive(Debug, Clone)]
pub struct RegisterPool {
    free: RegBitSet,
    allocatable: RegBitSet,
}

impl RegisterPool {
    /// Build a pool whose free list starts as the allocatable set.
    pub fn new(allocatable: RegBitSet) -> Self {
        Self {
            free: allocatable,
            allocatable,
        }
    }

    /// Take the lowest free register in `bank`, or `None` when the bank is
    /// exhausted and the caller must spill.
    pub fn allocate(&mut self, bank: u8) -> Option<AsmReg> {
        let reg = self.free.first_in_bank(bank)?;
        self.free.clear(reg);
        Some(reg)
    }

    /// Return a register to the free list.
    pub fn free(&mut self, reg: AsmReg) {
        debug_assert!(self.allocatable.contains(reg), "freeing foreign register");
        debug_assert!(!self.free.contains(reg), "double free of {reg:?}");
        self.free.set(reg);
    }

    pub fn free_count(&self, bank: u8) -> u32 {
        self.free.count_in_bank(bank)
    }

    pub fn total_count(&self, bank: u8) -> u32 {
        self.allocatable.count_in_bank(bank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> RegisterPool {
        let mut set = RegBitSet::new();
        for id in 0..4 {
            set.set(AsmReg::new(BANK_GP, id));
        }
        for id in 0..2 {
            set.set(AsmReg::new(BANK_XMM, id));
        }
        RegisterPool::new(set)
    }

    #[test]
    fn test_bitset_operations() {
        let mut set = RegBitSet::new();
        let reg = AsmReg::new(BANK_GP, 5);

        assert!(!set.contains(reg));
        set.set(reg);
        assert!(set.contains(reg));
        set.clear(reg);
        assert!(!set.contains(reg));
    }

    #[test]
    fn test_allocation_is_lowest_first() {
        let mut pool = pool();
        assert_eq!(pool.allocate(BANK_GP), Some(AsmReg::new(BANK_GP, 0)));
        assert_eq!(pool.allocate(BANK_GP), Some(AsmReg::new(BANK_GP, 1)));
    }

    #[test]
    fn test_banks_are_disjoint() {
        let mut pool = pool();
        for _ in 0..4 {
            assert_eq!(pool.allocate(BANK_GP).unwrap().bank, BANK_GP);
        }
        // GP exhaustion never leaks into the XMM bank.
        assert_eq!(pool.allocate(BANK_GP), None);
        assert_eq!(pool.free_count(BANK_XMM), 2);
        assert_eq!(pool.allocate(BANK_XMM).unwrap().bank, BANK_XMM);
    }

    #[test]
    fn test_free_makes_register_reusable() {
        let mut pool = pool();
        let a = pool.allocate(BANK_GP).unwrap();
        let b = pool.allocate(BANK_GP).unwrap();
        pool.free(a);
        assert_eq!(pool.allocate(BANK_GP), Some(a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_rex_extension() {
        assert!(!AsmReg::new(BANK_GP, 7).needs_rex_ext());
        assert!(AsmReg::new(BANK_GP, 8).needs_rex_ext());
        assert_eq!(AsmReg::new(BANK_GP, 9).low_bits(), 1);
    }
}
