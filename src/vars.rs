//! Variable and scope table
//!
//! Variables live in a single ordered list.  A sentinel entry named `----`
//! marks the boundary between an outer and an inner scope: local lookup
//! stops at the nearest sentinel, global lookup only considers entries
//! before the first one.  Entering a subroutine pushes a sentinel and
//! returning releases every descriptor newer than it in one operation.
//!
//! While interpreting, variable payloads are stored in a 64K byte arena so
//! that the address-of operator, the `*`/`^` dereference operators and the
//! poke statements all work on plain 16-bit addresses.  The arena is a bump
//! allocator growing down from the top of the address space; releasing a
//! scope rewinds the bump pointer to the mark the sentinel recorded.
//!
//! While compiling, payloads live on the *target* call stack instead and
//! descriptors hold target addresses; see `Location`.

use crate::error::Error;
use crate::lexer::ShortName;

/// Lowest address the arena will allocate; allocation below this is an
/// out-of-memory error.
pub const ARENA_FLOOR: u32 = 0x8000;

const ARENA_TOP: u32 = 0x10000;

/// Reserved name marking a scope boundary.
pub const SENTINEL_NAME: ShortName = *b"----";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Word,
    Byte,
}

impl VarType {
    /// Storage size of one element in bytes.
    pub fn size(self) -> u16 {
        match self {
            VarType::Word => 2,
            VarType::Byte => 1,
        }
    }
}

/// Where a variable's payload lives.  Interpret mode uses the arena; the
/// compiler records target-VM addresses instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Arena offset of the payload (scalar cell or array body).
    Arena(u16),
    /// Absolute target address (global in compiled code).
    TargetAbs(u16),
    /// Frame-pointer-relative target address (local in compiled code).
    TargetRel(i16),
    /// FP-relative slot holding the absolute payload address of an array
    /// passed by reference.
    TargetRefSlot(i16),
}

/// One variable descriptor.
#[derive(Debug, Clone, Copy)]
pub struct VarEnt {
    pub name: ShortName,
    pub ty: VarType,
    /// 0 for scalars, 1 for arrays.
    pub dims: u8,
    /// Element count; 1 for scalars.
    pub size: u16,
    pub loc: Location,
}

impl VarEnt {
    fn sentinel() -> Self {
        VarEnt {
            name: SENTINEL_NAME,
            ty: VarType::Word,
            dims: 0,
            size: 0,
            loc: Location::Arena(0),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.name == SENTINEL_NAME
    }
}

/// Bump allocator over the interpreter's 64K address space.
pub struct Arena {
    mem: Vec<u8>,
    ptr: u32,
}

impl Arena {
    pub fn new() -> Self {
        Arena {
            mem: vec![0; 64 * 1024],
            ptr: ARENA_TOP,
        }
    }

    pub fn reset(&mut self) {
        self.ptr = ARENA_TOP;
    }

    /// Allocate `bytes` and return the offset of the block.
    pub fn alloc(&mut self, bytes: u32) -> Result<u16, Error> {
        if self.ptr < ARENA_FLOOR + bytes {
            return Err(Error::NoMem);
        }
        self.ptr -= bytes;
        Ok(self.ptr as u16)
    }

    /// Current bump pointer, recorded by scope sentinels.
    pub fn mark(&self) -> u32 {
        self.ptr
    }

    pub fn release_to(&mut self, mark: u32) {
        self.ptr = mark;
    }

    /// Bytes left before the floor.
    pub fn free_space(&self) -> u16 {
        (self.ptr - ARENA_FLOOR) as u16
    }

    pub fn peek_byte(&self, addr: u16) -> u8 {
        self.mem[addr as usize]
    }

    pub fn poke_byte(&mut self, addr: u16, val: u8) {
        self.mem[addr as usize] = val;
    }

    /// Little-endian 16-bit read; the address wraps at the top of memory.
    pub fn peek_word(&self, addr: u16) -> u16 {
        let lo = self.mem[addr as usize];
        let hi = self.mem[addr.wrapping_add(1) as usize];
        u16::from_le_bytes([lo, hi])
    }

    pub fn poke_word(&mut self, addr: u16, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        self.mem[addr as usize] = lo;
        self.mem[addr.wrapping_add(1) as usize] = hi;
    }
}

/// The two-level name table: one global scope plus a stack of call frames
/// delimited by sentinel entries.
pub struct ScopeTable {
    pub ents: Vec<VarEnt>,
    pub arena: Arena,
    marks: Vec<u32>,
}

impl ScopeTable {
    pub fn new() -> Self {
        ScopeTable {
            ents: Vec::new(),
            arena: Arena::new(),
            marks: Vec::new(),
        }
    }

    /// Find a variable.  Local search scans from the nearest sentinel to
    /// the tail; if `local_only` is unset and that misses, global search
    /// scans the head of the list up to the first sentinel.  Returns the
    /// entry index and whether it was found in the local scope.
    pub fn find(&self, key: &ShortName, local_only: bool) -> Option<(usize, bool)> {
        let local_start = self
            .ents
            .iter()
            .rposition(VarEnt::is_sentinel)
            .map(|i| i + 1)
            .unwrap_or(0);
        for (i, ent) in self.ents.iter().enumerate().skip(local_start) {
            if &ent.name == key {
                return Some((i, true));
            }
        }
        if local_only {
            return None;
        }
        for (i, ent) in self.ents.iter().enumerate() {
            if ent.is_sentinel() {
                break;
            }
            if &ent.name == key {
                return Some((i, false));
            }
        }
        None
    }

    /// Error if `key` already exists in the innermost scope.
    pub fn check_redef(&self, key: &ShortName) -> Result<(), Error> {
        if self.find(key, true).is_some() {
            Err(Error::Redef)
        } else {
            Ok(())
        }
    }

    /// Append a descriptor to the innermost scope.  The caller has already
    /// allocated the payload.
    pub fn insert(&mut self, ent: VarEnt) {
        self.ents.push(ent);
    }

    /// Create an interpret-mode variable, allocating (or aliasing) arena
    /// storage and initializing every element.
    pub fn create_interp(
        &mut self,
        key: ShortName,
        ty: VarType,
        dims: u8,
        size: u16,
        init: u16,
        alias: Option<u16>,
    ) -> Result<(), Error> {
        self.check_redef(&key)?;
        if size < 1 {
            return Err(Error::Dim);
        }
        let off = match alias {
            Some(off) => off,
            None => {
                let off = self.arena.alloc(size as u32 * ty.size() as u32)?;
                for i in 0..size {
                    match ty {
                        VarType::Word => self.arena.poke_word(off + i * 2, init),
                        VarType::Byte => self.arena.poke_byte(off + i, init as u8),
                    }
                }
                off
            }
        };
        self.insert(VarEnt {
            name: key,
            ty,
            dims,
            size,
            loc: Location::Arena(off),
        });
        Ok(())
    }

    /// True while at least one call frame is open.
    pub fn in_frame(&self) -> bool {
        !self.marks.is_empty()
    }

    /// Push a scope sentinel on subroutine entry.
    pub fn mark_call_frame(&mut self) {
        self.marks.push(self.arena.mark());
        self.ents.push(VarEnt::sentinel());
    }

    /// Release every descriptor newer than the innermost sentinel and
    /// rewind the arena to the recorded mark.
    pub fn delete_call_frame(&mut self) {
        if let Some(idx) = self.ents.iter().rposition(VarEnt::is_sentinel) {
            self.ents.truncate(idx);
        }
        if let Some(mark) = self.marks.pop() {
            self.arena.release_to(mark);
        }
    }

    /// Discard all open call frames (error unwinding).
    pub fn unwind_frames(&mut self) {
        while self.in_frame() {
            self.delete_call_frame();
        }
    }

    /// Delete everything.
    pub fn clear(&mut self) {
        self.ents.clear();
        self.marks.clear();
        self.arena.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::short_name;

    #[test]
    fn test_scalar_create_and_read() {
        let mut t = ScopeTable::new();
        t.create_interp(short_name("x"), VarType::Word, 0, 1, 1234, None)
            .unwrap();
        let (i, _) = t.find(&short_name("x"), false).unwrap();
        let Location::Arena(off) = t.ents[i].loc else {
            panic!("expected arena storage");
        };
        assert_eq!(t.arena.peek_word(off), 1234);
    }

    #[test]
    fn test_redefinition_is_an_error() {
        let mut t = ScopeTable::new();
        t.create_interp(short_name("x"), VarType::Word, 0, 1, 0, None)
            .unwrap();
        let err = t
            .create_interp(short_name("x"), VarType::Byte, 0, 1, 0, None)
            .unwrap_err();
        assert_eq!(err, Error::Redef);
    }

    #[test]
    fn test_name_key_is_four_chars() {
        let mut t = ScopeTable::new();
        t.create_interp(short_name("counter"), VarType::Word, 0, 1, 7, None)
            .unwrap();
        // "countdown" shares the first four characters
        assert!(t.find(&short_name("countdown"), false).is_some());
    }

    #[test]
    fn test_local_shadows_global() {
        let mut t = ScopeTable::new();
        t.create_interp(short_name("x"), VarType::Word, 0, 1, 1, None)
            .unwrap();
        t.mark_call_frame();
        t.create_interp(short_name("x"), VarType::Word, 0, 1, 2, None)
            .unwrap();
        let (i, local) = t.find(&short_name("x"), false).unwrap();
        assert!(local);
        let Location::Arena(off) = t.ents[i].loc else {
            panic!()
        };
        assert_eq!(t.arena.peek_word(off), 2);

        t.delete_call_frame();
        let (i, local) = t.find(&short_name("x"), false).unwrap();
        assert!(local, "with no frame open the whole list is local scope");
        let Location::Arena(off) = t.ents[i].loc else {
            panic!()
        };
        assert_eq!(t.arena.peek_word(off), 1);
    }

    #[test]
    fn test_globals_invisible_to_local_only_search() {
        let mut t = ScopeTable::new();
        t.create_interp(short_name("g"), VarType::Word, 0, 1, 0, None)
            .unwrap();
        t.mark_call_frame();
        assert!(t.find(&short_name("g"), true).is_none());
        assert!(t.find(&short_name("g"), false).is_some());
    }

    #[test]
    fn test_frame_release_rewinds_arena() {
        let mut t = ScopeTable::new();
        let before = t.arena.mark();
        t.mark_call_frame();
        t.create_interp(short_name("tmp"), VarType::Word, 1, 100, 0, None)
            .unwrap();
        assert!(t.arena.mark() < before);
        t.delete_call_frame();
        assert_eq!(t.arena.mark(), before);
        assert!(t.find(&short_name("tmp"), false).is_none());
    }

    #[test]
    fn test_array_alias_shares_payload() {
        let mut t = ScopeTable::new();
        t.create_interp(short_name("a"), VarType::Word, 1, 3, 9, None)
            .unwrap();
        let (i, _) = t.find(&short_name("a"), false).unwrap();
        let Location::Arena(body) = t.ents[i].loc else {
            panic!()
        };
        t.mark_call_frame();
        t.create_interp(short_name("v"), VarType::Word, 1, 3, 0, Some(body))
            .unwrap();
        let (j, _) = t.find(&short_name("v"), false).unwrap();
        assert_eq!(t.ents[j].loc, Location::Arena(body));
        t.arena.poke_word(body + 2, 42);
        t.delete_call_frame();
        assert_eq!(t.arena.peek_word(body + 2), 42);
    }

    #[test]
    fn test_arena_exhaustion() {
        let mut a = Arena::new();
        assert!(a.alloc(0x8001).is_err());
        assert!(a.alloc(0x8000).is_ok());
        assert!(a.alloc(1).is_err());
    }
}
