//! The guest side of the recompiler: the architectural register file the generated code operates
//! on, the decoded instruction classes the translator lowers, and the [Guest] trait through which
//! the embedding emulator supplies decoding, memory and exception delivery.
//!
//! The register file is deliberately small and fixed: 32 general purpose registers, a link
//! register, and two 64-bit accumulators which can also be addressed as a pair of 32-bit halves.
//! The halves are "views" of their parent: the register allocator has to keep the two coherent.

use static_assertions::const_assert_eq;
use std::{fmt, mem::offset_of, ptr::NonNull};
use strum::{Display, EnumCount, EnumIter, FromRepr};

/// A guest virtual address.
pub type GuestAddr = u32;

/// How many general purpose registers does the guest have?
pub const NUM_GPRS: usize = 32;
/// How many 64-bit accumulators does the guest have?
pub const NUM_ACCS: usize = 2;

/// The total number of allocatable guest register slots: GPRs, the link register, and for each
/// accumulator the accumulator itself plus its high and low halves.
pub(crate) const NUM_SLOTS: usize = NUM_GPRS + 1 + NUM_ACCS * 3;

/// An abstract guest register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GuestReg {
    /// A 32-bit general purpose register.
    Gpr(u8),
    /// The 32-bit link register, written by branch-and-link instructions.
    Lr,
    /// A 64-bit accumulator.
    Acc(u8),
    /// The upper 32 bits of an accumulator.
    AccHi(u8),
    /// The lower 32 bits of an accumulator.
    AccLo(u8),
}

impl GuestReg {
    /// Is this a register that actually exists on the guest?
    pub fn is_valid(self) -> bool {
        match self {
            GuestReg::Gpr(n) => usize::from(n) < NUM_GPRS,
            GuestReg::Lr => true,
            GuestReg::Acc(n) | GuestReg::AccHi(n) | GuestReg::AccLo(n) => usize::from(n) < NUM_ACCS,
        }
    }

    /// This register's index in the allocator's slot table.
    pub(crate) fn slot(self) -> usize {
        match self {
            GuestReg::Gpr(n) => usize::from(n),
            GuestReg::Lr => NUM_GPRS,
            GuestReg::Acc(n) => NUM_GPRS + 1 + usize::from(n),
            GuestReg::AccHi(n) => NUM_GPRS + 1 + NUM_ACCS + usize::from(n),
            GuestReg::AccLo(n) => NUM_GPRS + 1 + 2 * NUM_ACCS + usize::from(n),
        }
    }

    /// The inverse of [Self::slot].
    pub(crate) fn from_slot(slot: usize) -> Self {
        let acc_base = NUM_GPRS + 1;
        match slot {
            x if x < NUM_GPRS => GuestReg::Gpr(x as u8),
            x if x == NUM_GPRS => GuestReg::Lr,
            x if x < acc_base + NUM_ACCS => GuestReg::Acc((x - acc_base) as u8),
            x if x < acc_base + 2 * NUM_ACCS => GuestReg::AccHi((x - acc_base - NUM_ACCS) as u8),
            x if x < NUM_SLOTS => GuestReg::AccLo((x - acc_base - 2 * NUM_ACCS) as u8),
            _ => panic!("slot {slot} out of range"),
        }
    }

    /// Is this register 64 bits wide?
    pub fn is_wide(self) -> bool {
        matches!(self, GuestReg::Acc(_))
    }

    /// If this register is a view into a wider register, return the parent and the bit shift of
    /// the view within it.
    pub fn parent(self) -> Option<(GuestReg, u8)> {
        match self {
            GuestReg::AccHi(n) => Some((GuestReg::Acc(n), 32)),
            GuestReg::AccLo(n) => Some((GuestReg::Acc(n), 0)),
            _ => None,
        }
    }

    /// If this register has views, return them.
    pub fn views(self) -> Option<[GuestReg; 2]> {
        match self {
            GuestReg::Acc(n) => Some([GuestReg::AccHi(n), GuestReg::AccLo(n)]),
            _ => None,
        }
    }

    /// The byte offset of this register's home location in [GuestState].
    pub(crate) fn state_offset(self) -> u32 {
        let acc = offset_of!(GuestState, acc);
        let off = match self {
            GuestReg::Gpr(n) => offset_of!(GuestState, gpr) + usize::from(n) * 4,
            GuestReg::Lr => offset_of!(GuestState, lr),
            GuestReg::Acc(n) | GuestReg::AccLo(n) => acc + usize::from(n) * 8,
            GuestReg::AccHi(n) => acc + usize::from(n) * 8 + 4,
        };
        off as u32
    }
}

impl fmt::Display for GuestReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestReg::Gpr(n) => write!(f, "r{n}"),
            GuestReg::Lr => write!(f, "lr"),
            GuestReg::Acc(n) => write!(f, "acc{n}"),
            GuestReg::AccHi(n) => write!(f, "acc{n}.hi"),
            GuestReg::AccLo(n) => write!(f, "acc{n}.lo"),
        }
    }
}

/// The architectural state of one guest core. Generated code addresses the fields of this
/// struct directly, so its layout is fixed.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct GuestState {
    pub gpr: [u32; NUM_GPRS],
    pub lr: u32,
    /// The address of the next instruction to execute.
    pub pc: GuestAddr,
    /// Cycles left in the current timeslice. Blocks subtract their cost from this and return to
    /// the dispatcher when it drops to zero or below.
    pub downcount: i32,
    /// Pending guest exceptions: a set of [GuestException::bit]s.
    pub exceptions: u32,
    pub acc: [u64; NUM_ACCS],
    pub(crate) rt: Runtime,
}

/// Fields used only by the generated code and the runtime that drives it.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub(crate) struct Runtime {
    /// A pointer to the execution context of the block currently running.
    pub(crate) ctx: usize,
    /// The base of the fast memory window, or 0.
    pub(crate) membase: usize,
    /// The host stack pointer to restore when leaving generated code.
    pub(crate) saved_sp: usize,
    /// A set of `EXIT_*` flags describing why generated code returned to the dispatcher.
    pub(crate) exit_flags: u32,
    /// The guest address whose cache line an `Icbi` asked to be invalidated.
    pub(crate) invalidate_addr: u32,
}

/// The block exited because it executed an instruction cache invalidation.
pub(crate) const EXIT_INVALIDATE: u32 = 1;

pub(crate) const PC_OFF: u32 = offset_of!(GuestState, pc) as u32;
pub(crate) const DOWNCOUNT_OFF: u32 = offset_of!(GuestState, downcount) as u32;
pub(crate) const EXCEPTIONS_OFF: u32 = offset_of!(GuestState, exceptions) as u32;
pub(crate) const CTX_OFF: u32 = (offset_of!(GuestState, rt) + offset_of!(Runtime, ctx)) as u32;
pub(crate) const MEMBASE_OFF: u32 =
    (offset_of!(GuestState, rt) + offset_of!(Runtime, membase)) as u32;
pub(crate) const SAVED_SP_OFF: u32 =
    (offset_of!(GuestState, rt) + offset_of!(Runtime, saved_sp)) as u32;
pub(crate) const EXIT_FLAGS_OFF: u32 =
    (offset_of!(GuestState, rt) + offset_of!(Runtime, exit_flags)) as u32;
pub(crate) const INVALIDATE_ADDR_OFF: u32 =
    (offset_of!(GuestState, rt) + offset_of!(Runtime, invalidate_addr)) as u32;

// The accumulators are accessed with 64-bit loads and stores, and their halves by offset, which
// assumes a little-endian host.
const_assert_eq!(offset_of!(GuestState, acc) % 8, 0);
const_assert_eq!(offset_of!(GuestState, rt) % 8, 0);
#[cfg(target_endian = "big")]
compile_error!("the accumulator views assume a little-endian host");

impl GuestState {
    /// Create a new guest state which will start executing at `pc`.
    pub fn new(pc: GuestAddr) -> Self {
        Self {
            gpr: [0; NUM_GPRS],
            lr: 0,
            pc,
            downcount: 0,
            exceptions: 0,
            acc: [0; NUM_ACCS],
            rt: Runtime::default(),
        }
    }

    /// Read the value of `reg`. 32-bit registers are zero extended.
    pub fn read(&self, reg: GuestReg) -> u64 {
        match reg {
            GuestReg::Gpr(n) => u64::from(self.gpr[usize::from(n)]),
            GuestReg::Lr => u64::from(self.lr),
            GuestReg::Acc(n) => self.acc[usize::from(n)],
            GuestReg::AccHi(n) => self.acc[usize::from(n)] >> 32,
            GuestReg::AccLo(n) => self.acc[usize::from(n)] & 0xFFFF_FFFF,
        }
    }

    /// Write `val` to `reg`. 32-bit registers take the low 32 bits of `val`.
    pub fn write(&mut self, reg: GuestReg, val: u64) {
        match reg {
            GuestReg::Gpr(n) => self.gpr[usize::from(n)] = val as u32,
            GuestReg::Lr => self.lr = val as u32,
            GuestReg::Acc(n) => self.acc[usize::from(n)] = val,
            GuestReg::AccHi(n) => {
                let a = &mut self.acc[usize::from(n)];
                *a = (*a & 0xFFFF_FFFF) | ((val & 0xFFFF_FFFF) << 32);
            }
            GuestReg::AccLo(n) => {
                let a = &mut self.acc[usize::from(n)];
                *a = (*a & !0xFFFF_FFFF) | (val & 0xFFFF_FFFF);
            }
        }
    }

    /// Mark `exc` as pending: it will be delivered at the next dispatch.
    pub fn set_exception(&mut self, exc: GuestException) {
        self.exceptions |= exc.bit();
    }
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new(0)
    }
}

/// The width of a guest memory access.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    Byte = 1,
    Half = 2,
    Word = 4,
}

impl AccessWidth {
    pub fn bytes(self) -> usize {
        self as usize
    }

    pub(crate) fn from_bytes(n: usize) -> Option<Self> {
        match n {
            1 => Some(AccessWidth::Byte),
            2 => Some(AccessWidth::Half),
            4 => Some(AccessWidth::Word),
            _ => None,
        }
    }

    /// Truncate `val` to this width, sign or zero extending it back to 32 bits.
    pub fn extend(self, val: u32, signed: bool) -> u32 {
        match (self, signed) {
            (AccessWidth::Byte, false) => val & 0xFF,
            (AccessWidth::Byte, true) => val as u8 as i8 as i32 as u32,
            (AccessWidth::Half, false) => val & 0xFFFF,
            (AccessWidth::Half, true) => val as u16 as i16 as i32 as u32,
            (AccessWidth::Word, _) => val,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum AluOp {
    #[strum(to_string = "add")]
    Add,
    #[strum(to_string = "sub")]
    Sub,
    #[strum(to_string = "and")]
    And,
    #[strum(to_string = "or")]
    Or,
    #[strum(to_string = "xor")]
    Xor,
    #[strum(to_string = "mul")]
    Mul,
}

impl AluOp {
    pub fn eval(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Mul => a.wrapping_mul(b),
        }
    }

    pub(crate) fn is_commutative(self) -> bool {
        !matches!(self, AluOp::Sub)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ShiftOp {
    #[strum(to_string = "shl")]
    Shl,
    #[strum(to_string = "shr")]
    Shr,
    #[strum(to_string = "sar")]
    Sar,
}

impl ShiftOp {
    pub fn eval(self, a: u32, amount: u8) -> u32 {
        let amount = u32::from(amount & 31);
        match self {
            ShiftOp::Shl => a << amount,
            ShiftOp::Shr => a >> amount,
            ShiftOp::Sar => ((a as i32) >> amount) as u32,
        }
    }
}

/// The condition of a compare-and-branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Cond {
    #[strum(to_string = "eq")]
    Eq,
    #[strum(to_string = "ne")]
    Ne,
    /// Unsigned less than.
    #[strum(to_string = "ltu")]
    LtU,
    /// Unsigned greater than or equal.
    #[strum(to_string = "geu")]
    GeU,
    #[strum(to_string = "lt")]
    Lt,
    #[strum(to_string = "ge")]
    Ge,
}

impl Cond {
    pub fn eval(self, a: u32, b: u32) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::LtU => a < b,
            Cond::GeU => a >= b,
            Cond::Lt => (a as i32) < (b as i32),
            Cond::Ge => (a as i32) >= (b as i32),
        }
    }
}

/// Guest exceptions. Each has a bit in [GuestState::exceptions].
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, FromRepr, PartialEq, Eq)]
pub enum GuestException {
    /// An instruction fetch from an address with no backing code.
    InstructionFetch,
    DataAccess,
    Program,
    Syscall,
    Trap,
    External,
}

impl GuestException {
    pub fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

/// An instruction as classified by the guest decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inst {
    LoadImm {
        rd: GuestReg,
        imm: u32,
    },
    Move {
        rd: GuestReg,
        rs: GuestReg,
    },
    AddImm {
        rd: GuestReg,
        ra: GuestReg,
        imm: i32,
    },
    Alu {
        op: AluOp,
        rd: GuestReg,
        ra: GuestReg,
        rb: GuestReg,
    },
    ShiftImm {
        op: ShiftOp,
        rd: GuestReg,
        ra: GuestReg,
        amount: u8,
    },
    /// `acc(n) += zext(ra) * zext(rb)`.
    MulAcc {
        acc: u8,
        ra: GuestReg,
        rb: GuestReg,
    },
    /// `rd = ext(mem[ra + offset])`.
    Load {
        width: AccessWidth,
        signed: bool,
        rd: GuestReg,
        ra: GuestReg,
        offset: i16,
    },
    /// `mem[ra + offset] = trunc(rs)`.
    Store {
        width: AccessWidth,
        rs: GuestReg,
        ra: GuestReg,
        offset: i16,
    },
    /// An unconditional direct branch. If `link`, the address of the next instruction is written
    /// to the link register.
    Branch {
        target: GuestAddr,
        link: bool,
    },
    BranchCond {
        cond: Cond,
        ra: GuestReg,
        rb: GuestReg,
        target: GuestAddr,
    },
    /// An indirect branch to the address held in `ra`.
    BranchReg {
        ra: GuestReg,
        link: bool,
    },
    /// Raise `kind`, resuming at the next instruction once the exception has been handled.
    Trap {
        kind: GuestException,
    },
    /// A privileged synchronisation point: execution must return to the dispatcher afterwards.
    Sync,
    /// Invalidate the guest instruction cache line containing `ra + offset`.
    Icbi {
        ra: GuestReg,
        offset: i16,
    },
    /// An instruction the translator does not lower: it is handed, as `word`, to
    /// [Guest::interpret]. It must not alter control flow.
    Interpret {
        word: u32,
    },
}

impl Inst {
    /// Does this instruction end a block?
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Inst::Branch { .. }
                | Inst::BranchCond { .. }
                | Inst::BranchReg { .. }
                | Inst::Trap { .. }
                | Inst::Sync
                | Inst::Icbi { .. }
        )
    }

    /// Every guest register this instruction names.
    pub(crate) fn operands(&self) -> smallvec::SmallVec<[GuestReg; 3]> {
        use smallvec::smallvec;
        match *self {
            Inst::LoadImm { rd, .. } => smallvec![rd],
            Inst::Move { rd, rs } => smallvec![rd, rs],
            Inst::AddImm { rd, ra, .. } | Inst::ShiftImm { rd, ra, .. } => smallvec![rd, ra],
            Inst::Alu { rd, ra, rb, .. } => smallvec![rd, ra, rb],
            Inst::MulAcc { acc, ra, rb } => smallvec![GuestReg::Acc(acc), ra, rb],
            Inst::Load { rd, ra, .. } => smallvec![rd, ra],
            Inst::Store { rs, ra, .. } => smallvec![rs, ra],
            Inst::BranchCond { ra, rb, .. } => smallvec![ra, rb],
            Inst::BranchReg { ra, .. } | Inst::Icbi { ra, .. } => smallvec![ra],
            Inst::Branch { .. } | Inst::Trap { .. } | Inst::Sync | Inst::Interpret { .. } => {
                smallvec![]
            }
        }
    }
}

/// The result of decoding one guest instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub inst: Inst,
    /// The length of the instruction in bytes.
    pub len: u32,
    /// How many guest cycles the instruction costs.
    pub cycles: u32,
}

/// The services the embedding emulator provides to the recompiler.
///
/// Implementations are driven from a single thread: the one running the [crate::Jit] that owns
/// them. The memory functions are also called from generated code, so they must not unwind.
pub trait Guest {
    /// Decode the instruction at `addr`. If `addr` has no backing code, return the exception the
    /// guest should take.
    fn decode(&mut self, addr: GuestAddr) -> Result<Decoded, GuestException>;

    /// The slow path for reads: perform a `width` sized read of `addr`.
    fn read(&mut self, addr: GuestAddr, width: AccessWidth) -> u32;

    /// The slow path for writes.
    fn write(&mut self, addr: GuestAddr, width: AccessWidth, val: u32);

    /// If `width` bytes at `addr` are plain RAM, return a host pointer to them.
    fn translate(&mut self, addr: GuestAddr, width: AccessWidth) -> Option<NonNull<u8>>;

    /// The base of a contiguous 4GiB host window mirroring guest memory, where RAM is mapped
    /// readable and writable and everything else faults. If `None`, native code routes every
    /// access through the slow path.
    fn fastmem_base(&self) -> Option<NonNull<u8>> {
        None
    }

    /// Deliver `exc`: typically this saves `state.pc` and redirects it to a handler.
    fn raise_exception(&mut self, state: &mut GuestState, exc: GuestException);

    /// `elapsed` guest cycles have passed since the last call.
    fn advance_time(&mut self, _state: &mut GuestState, _elapsed: u32) {}

    /// Execute an instruction the translator classified as [Inst::Interpret].
    fn interpret(&mut self, state: &mut GuestState, _pc: GuestAddr, _word: u32) {
        state.set_exception(GuestException::Program);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_round_trip() {
        for slot in 0..NUM_SLOTS {
            assert_eq!(GuestReg::from_slot(slot).slot(), slot);
        }
    }

    #[test]
    fn views_alias_parent() {
        let mut s = GuestState::new(0);
        s.write(GuestReg::Acc(1), 0x1122_3344_5566_7788);
        assert_eq!(s.read(GuestReg::AccHi(1)), 0x1122_3344);
        assert_eq!(s.read(GuestReg::AccLo(1)), 0x5566_7788);
        s.write(GuestReg::AccHi(1), 0xAABB_CCDD);
        assert_eq!(s.acc[1], 0xAABB_CCDD_5566_7788);
        assert_eq!(
            GuestReg::AccHi(1).state_offset(),
            GuestReg::Acc(1).state_offset() + 4
        );
        assert_eq!(GuestReg::AccHi(0).parent(), Some((GuestReg::Acc(0), 32)));
    }

    #[test]
    fn extend() {
        assert_eq!(AccessWidth::Byte.extend(0x1FF, false), 0xFF);
        assert_eq!(AccessWidth::Byte.extend(0x80, true), 0xFFFF_FF80);
        assert_eq!(AccessWidth::Half.extend(0x8000, true), 0xFFFF_8000);
        assert_eq!(AccessWidth::Word.extend(0x8000_0000, true), 0x8000_0000);
    }

    #[test]
    fn conds() {
        assert!(Cond::LtU.eval(1, 0xFFFF_FFFF));
        assert!(!Cond::Lt.eval(1, 0xFFFF_FFFF));
        assert!(Cond::Ge.eval(0, 0xFFFF_FFFF));
    }
}
