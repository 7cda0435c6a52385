//! The heap: an immobile bump-allocated arena of cells.
//!
//! All runtime objects (datakeys, strings, function objects) live in a
//! single `Pool` sized at machine birth. Allocation only moves a high-water
//! mark; objects are never relocated or freed, so a cell index taken at
//! allocation time stays valid for the life of the machine. The layouts
//! below keep room for a future collector (reserved cells, tag bitmap
//! length) without requiring one.
//!
//! Every object is identified by the cell holding its datakey pointer; the
//! "object pointer" handed around the machine is the index of that cell.
//! Two objects have the same runtime type exactly when their datakey cells
//! hold the same address.

use std::fmt;

use super::cell::{Cell, CellIdx};

/// Default pool size: 1 MiB of 8-byte cells.
pub const DEFAULT_POOL_CELLS: usize = 131_072;

/// Object flavours. Only Datakey, Binarray (strings) and Function are laid
/// out by this machine; Record and Vector are reserved flavour values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flavour {
    Datakey = 0,
    Record = 1,
    Vector = 2,
    Binarray = 3,
    Function = 4,
}

/// Errors raised by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// The pool has no room for the requested allocation.
    OutOfMemory { requested: usize, available: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, available } => {
                write!(f, "heap exhausted: requested {} cells, {} available", requested, available)
            }
        }
    }
}

impl std::error::Error for HeapError {}

pub type HeapResult<T> = Result<T, HeapError>;

/// A fixed-size linear allocation arena.
pub struct Pool {
    cells: Box<[Cell]>,
    next_free: usize,
}

impl Pool {
    pub fn new(num_cells: usize) -> Pool {
        Pool {
            cells: vec![Cell::ZERO; num_cells].into_boxed_slice(),
            next_free: 0,
        }
    }

    /// Reserve `n` contiguous cells and return the index of the first.
    /// On failure the high-water mark is untouched.
    pub fn allocate(&mut self, n: usize) -> HeapResult<CellIdx> {
        let available = self.cells.len() - self.next_free;
        if n > available {
            return Err(HeapError::OutOfMemory { requested: n, available });
        }
        let base = self.next_free;
        self.next_free += n;
        Ok(base)
    }

    #[inline]
    pub fn get(&self, ix: CellIdx) -> Option<Cell> {
        self.cells.get(ix).copied()
    }

    #[inline]
    pub fn set(&mut self, ix: CellIdx, cell: Cell) -> Option<()> {
        self.cells.get_mut(ix).map(|c| *c = cell)
    }

    /// Current allocation position.
    pub fn next_free(&self) -> usize {
        self.next_free
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }
}

/// Accumulates cells in a transient buffer and commits them to the pool in
/// one step, so a partially-constructed object is never visible.
#[derive(Default)]
pub struct ObjectBuilder {
    cells: Vec<Cell>,
}

impl ObjectBuilder {
    pub fn new() -> ObjectBuilder {
        ObjectBuilder::default()
    }

    pub fn push(&mut self, cell: Cell) {
        self.cells.push(cell);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Commit the accumulated cells, returning the index of the first.
    /// All-or-nothing: on allocation failure the pool is unchanged and the
    /// builder keeps its contents.
    pub fn commit(&mut self, pool: &mut Pool) -> HeapResult<CellIdx> {
        let base = pool.allocate(self.cells.len())?;
        for (i, cell) in self.cells.drain(..).enumerate() {
            // In-bounds by the allocation above.
            pool.set(base + i, cell);
        }
        Ok(base)
    }

    pub fn reset(&mut self) {
        self.cells.clear();
    }
}

/// The heap proper: the pool plus the three bootstrap datakeys.
pub struct Heap {
    pool: Pool,
    datakey_datakey: CellIdx,
    string_datakey: CellIdx,
    function_datakey: CellIdx,
}

// Datakey layout, relative to the object base:
//   [0] flavour byte   [1] bit width (Binarray) or 0
//   [2] reserved       [3] reserved
//   [4] pointer to this datakey's own datakey
const DATAKEY_CELLS: usize = 5;

impl Heap {
    /// Create a heap with `num_cells` of backing storage. The pool is
    /// clamped so the bootstrap datakeys always fit.
    pub fn new(num_cells: usize) -> Heap {
        let mut pool = Pool::new(num_cells.max(3 * DATAKEY_CELLS));

        // The datakey of all datakeys points at itself.
        let datakey_datakey = Self::bootstrap_datakey(&mut pool, 0, None);
        let string_datakey = Self::bootstrap_datakey(&mut pool, 8, Some(datakey_datakey));
        let function_datakey = Self::bootstrap_datakey(&mut pool, 0, Some(datakey_datakey));

        Heap { pool, datakey_datakey, string_datakey, function_datakey }
    }

    fn bootstrap_datakey(pool: &mut Pool, bit_width: u64, own: Option<CellIdx>) -> CellIdx {
        // The pool was sized for the bootstrap objects.
        let base = match pool.allocate(DATAKEY_CELLS) {
            Ok(base) => base,
            Err(_) => unreachable!("bootstrap pool too small"),
        };
        pool.set(base, Cell::raw_u64(Flavour::Datakey as u64));
        pool.set(base + 1, Cell::raw_u64(bit_width));
        pool.set(base + 2, Cell::ZERO);
        pool.set(base + 3, Cell::ZERO);
        pool.set(base + 4, Cell::raw_ptr(own.unwrap_or(base)));
        base
    }

    pub fn datakey_datakey(&self) -> CellIdx {
        self.datakey_datakey
    }

    pub fn string_datakey(&self) -> CellIdx {
        self.string_datakey
    }

    pub fn function_datakey(&self) -> CellIdx {
        self.function_datakey
    }

    /// Reserve `n` contiguous cells.
    pub fn allocate(&mut self, n: usize) -> HeapResult<CellIdx> {
        self.pool.allocate(n)
    }

    #[inline]
    pub fn get(&self, ix: CellIdx) -> Option<Cell> {
        self.pool.get(ix)
    }

    #[inline]
    pub fn set(&mut self, ix: CellIdx, cell: Cell) -> Option<()> {
        self.pool.set(ix, cell)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut Pool {
        &mut self.pool
    }

    // === Strings ===
    //
    // String layout (a Binarray with bit width 8):
    //   [base + 0] length in bytes, including a trailing NUL
    //   [base + 1] datakey pointer  <- the object pointer
    //   [base + 2 ..] bytes packed little-endian into cells
    // The length sits at offset -1 from the object pointer.

    /// Allocate a string object; the returned index is the datakey cell.
    pub fn alloc_string(&mut self, text: &str) -> HeapResult<CellIdx> {
        let bytes = text.as_bytes();
        let char_count = bytes.len() + 1; // trailing NUL
        let data_cells = char_count.div_ceil(8);

        let mut builder = ObjectBuilder::new();
        builder.push(Cell::raw_u64(char_count as u64));
        builder.push(Cell::raw_ptr(self.string_datakey));
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            builder.push(Cell::raw_u64(u64::from_le_bytes(word)));
        }
        // A length that is an exact multiple of 8 still needs a cell for
        // the NUL.
        for _ in bytes.chunks(8).count()..data_cells {
            builder.push(Cell::ZERO);
        }

        let base = builder.commit(&mut self.pool)?;
        Ok(base + 1)
    }

    pub fn is_string_object(&self, obj: CellIdx) -> bool {
        self.pool.get(obj) == Some(Cell::raw_ptr(self.string_datakey))
    }

    /// The string's bytes, without the trailing NUL.
    pub fn string_bytes(&self, obj: CellIdx) -> Option<Vec<u8>> {
        if !self.is_string_object(obj) || obj == 0 {
            return None;
        }
        let char_count = self.pool.get(obj - 1)?.bits() as usize;
        let byte_len = char_count.checked_sub(1)?;
        let mut bytes = Vec::with_capacity(byte_len);
        let mut remaining = byte_len;
        let mut ix = obj + 1;
        while remaining > 0 {
            let word = self.pool.get(ix)?.bits().to_le_bytes();
            let take = remaining.min(8);
            bytes.extend_from_slice(&word[..take]);
            remaining -= take;
            ix += 1;
        }
        Some(bytes)
    }

    /// The string's text, lossily decoded.
    pub fn string_text(&self, obj: CellIdx) -> Option<String> {
        self.string_bytes(obj).map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    // === Function objects ===
    //
    // Function layout:
    //   [base + 0] instruction-word count N (tagged int)
    //   [base + 1] tag-bitmap length L (tagged int, always 0 here)
    //   [base + 2] datakey pointer  <- the object pointer
    //   [base + 3] packed metadata: nparams | nextras << 16 | nlocals << 32
    //   [base + 4 ..] N instruction words
    // Relative to the object pointer: metadata at +1, code at +2, N at -2.

    /// Allocate a function object, copying `code` into the code region.
    /// The returned index is the datakey cell.
    pub fn alloc_function(&mut self, code: &[Cell], nlocals: u16, nparams: u16) -> HeapResult<CellIdx> {
        let nextras = nlocals.saturating_sub(nparams);
        let meta = (nparams as u64) | ((nextras as u64) << 16) | ((nlocals as u64) << 32);

        let mut builder = ObjectBuilder::new();
        builder.push(Cell::tag_int(code.len() as i64));
        builder.push(Cell::tag_int(0));
        builder.push(Cell::raw_ptr(self.function_datakey));
        builder.push(Cell::raw_u64(meta));
        for &word in code {
            builder.push(word);
        }

        let base = builder.commit(&mut self.pool)?;
        Ok(base + 2)
    }

    pub fn is_function_object(&self, obj: CellIdx) -> bool {
        self.pool.get(obj) == Some(Cell::raw_ptr(self.function_datakey))
    }

    /// Index of the first instruction word.
    #[inline]
    pub fn function_code(&self, obj: CellIdx) -> CellIdx {
        obj + 2
    }

    pub fn function_code_len(&self, obj: CellIdx) -> Option<usize> {
        if obj < 2 {
            return None;
        }
        self.pool.get(obj - 2).map(|c| c.untag_int() as usize)
    }

    fn function_meta(&self, obj: CellIdx) -> Option<u64> {
        self.pool.get(obj + 1).map(Cell::bits)
    }

    pub fn function_nparams(&self, obj: CellIdx) -> Option<usize> {
        self.function_meta(obj).map(|m| (m & 0xFFFF) as usize)
    }

    pub fn function_nextras(&self, obj: CellIdx) -> Option<usize> {
        self.function_meta(obj).map(|m| ((m >> 16) & 0xFFFF) as usize)
    }

    pub fn function_nlocals(&self, obj: CellIdx) -> Option<usize> {
        self.function_meta(obj).map(|m| ((m >> 32) & 0xFFFF) as usize)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("capacity", &self.pool.capacity())
            .field("used", &self.pool.next_free())
            .finish()
    }
}
