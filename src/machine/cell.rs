//! The 64-bit cell and its tag algebra.
//!
//! A `Cell` is the machine's single unit of storage. The same 64 bits can
//! hold a tagged value (integer, float, heap pointer, or special literal),
//! or raw data such as a handler id, a code offset, or a saved return
//! address. Raw cells are bitwise indistinguishable from tagged ones and
//! are only meaningful in positions known by construction.
//!
//! Tag layout (low bits):
//!
//! | pattern | meaning |
//! |---------|---------|
//! | `xx00`  | 62-bit signed integer, value in bits 2..63 |
//! | `xx10`  | 62-bit float, IEEE-754 bit pattern shifted left 2 |
//! | `001`   | pointer to an 8-byte-aligned heap object |
//! | `111`   | special literal (FALSE, TRUE, NIL, UNDEF) |

use std::fmt;

/// Index of a cell in the heap pool. Object addresses are derived from
/// these by shifting left 3, which makes every address 8-byte aligned.
pub type CellIdx = usize;

const TAG_MASK_2BIT: u64 = 0x3;
const TAG_MASK_3BIT: u64 = 0x7;

const TAG_FLOAT: u64 = 0x2;
const TAG_PTR: u64 = 0x1;

const SPECIAL_FALSE: u64 = 0x07;
const SPECIAL_TRUE: u64 = 0x0F;
const SPECIAL_NIL: u64 = 0x17;
const SPECIAL_UNDEF: u64 = 0x1F;

/// A 64-bit unit of storage.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cell(u64);

impl Cell {
    pub const FALSE: Cell = Cell(SPECIAL_FALSE);
    pub const TRUE: Cell = Cell(SPECIAL_TRUE);
    pub const NIL: Cell = Cell(SPECIAL_NIL);
    pub const UNDEF: Cell = Cell(SPECIAL_UNDEF);

    /// The zero cell. Used as a placeholder for operands patched later.
    pub const ZERO: Cell = Cell(0);

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Cell {
        Cell(bits)
    }

    // === Tagged integers (xx00) ===

    /// Tag a signed integer. The value must fit in 62 bits; the two low
    /// tag bits are zero, so untagged arithmetic stays ordinary i64
    /// arithmetic after an arithmetic shift right.
    #[inline]
    pub fn tag_int(value: i64) -> Cell {
        Cell((value as u64) << 2)
    }

    /// Arithmetic shift right by 2: recovers all 62 bits with sign.
    #[inline]
    pub fn untag_int(self) -> i64 {
        (self.0 as i64) >> 2
    }

    #[inline]
    pub fn is_int(self) -> bool {
        self.0 & TAG_MASK_2BIT == 0
    }

    // === Tagged floats (xx10) ===

    #[inline]
    pub fn tag_float(value: f64) -> Cell {
        Cell((value.to_bits() << 2) | TAG_FLOAT)
    }

    /// Recovers the low 62 bits of the IEEE-754 pattern; the top two bits
    /// were sacrificed to the tag when encoding.
    #[inline]
    pub fn untag_float(self) -> f64 {
        f64::from_bits(self.0 >> 2)
    }

    #[inline]
    pub fn is_float(self) -> bool {
        self.0 & TAG_MASK_2BIT == TAG_FLOAT
    }

    // === Tagged pointers (001) ===

    /// Tag a heap object reference. The address is the cell index shifted
    /// left 3, so the low three bits are free for the tag.
    #[inline]
    pub fn tag_ptr(ix: CellIdx) -> Cell {
        Cell(((ix as u64) << 3) | TAG_PTR)
    }

    /// Clears the low 3 bits and recovers the cell index.
    #[inline]
    pub fn untag_ptr(self) -> CellIdx {
        ((self.0 & !TAG_MASK_3BIT) >> 3) as CellIdx
    }

    #[inline]
    pub fn is_ptr(self) -> bool {
        self.0 & TAG_MASK_3BIT == TAG_PTR
    }

    // === Specials (111) ===

    #[inline]
    pub fn from_bool(value: bool) -> Cell {
        if value {
            Cell::TRUE
        } else {
            Cell::FALSE
        }
    }

    #[inline]
    pub fn is_bool(self) -> bool {
        self.0 == SPECIAL_TRUE || self.0 == SPECIAL_FALSE
    }

    #[inline]
    pub fn as_bool(self) -> bool {
        self.0 == SPECIAL_TRUE
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == SPECIAL_NIL
    }

    #[inline]
    pub fn is_undef(self) -> bool {
        self.0 == SPECIAL_UNDEF
    }

    // === Raw cells ===
    //
    // Raw cells carry untyped payloads inside instruction streams and
    // return-stack frames: handler ids, frame offsets, jump offsets, and
    // saved addresses. They bypass the tag algebra entirely.

    #[inline]
    pub fn raw_i64(value: i64) -> Cell {
        Cell(value as u64)
    }

    #[inline]
    pub fn as_raw_i64(self) -> i64 {
        self.0 as i64
    }

    #[inline]
    pub fn raw_u64(value: u64) -> Cell {
        Cell(value)
    }

    /// Embed an untagged object or code address (cell index shifted left
    /// 3, low bits zero).
    #[inline]
    pub fn raw_ptr(ix: CellIdx) -> Cell {
        Cell((ix as u64) << 3)
    }

    #[inline]
    pub fn as_raw_ptr(self) -> CellIdx {
        (self.0 >> 3) as CellIdx
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_int() {
            write!(f, "Cell(int {})", self.untag_int())
        } else if self.is_ptr() {
            write!(f, "Cell(ptr {:#x})", self.0 & !TAG_MASK_3BIT)
        } else if self.is_bool() {
            write!(f, "Cell(bool {})", self.as_bool())
        } else if self.is_nil() {
            write!(f, "Cell(nil)")
        } else if self.is_undef() {
            write!(f, "Cell(undef)")
        } else if self.is_float() {
            write!(f, "Cell(float {})", self.untag_float())
        } else {
            write!(f, "Cell({:#018x})", self.0)
        }
    }
}
