//! x64 general purpose registers and the roles generated code gives them.

use crate::compile::HostReg;
use iced_x86::Register;
use std::fmt;
use strum::{EnumCount, FromRepr};

#[derive(Clone, Copy, Debug, EnumCount, FromRepr, PartialEq, Eq)]
// The discriminants are the hardware register numbers, which `HostReg::idx` relies on.
#[repr(u8)]
pub(crate) enum Reg {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// Holds a pointer to the [crate::guest::GuestState] for as long as generated code runs.
pub(super) const STATE: Reg = Reg::RBP;
/// Holds the base of the fast memory window.
pub(super) const MEMBASE: Reg = Reg::R15;
/// Never allocated: used for effective addresses and as a temporary.
pub(super) const SCRATCH: Reg = Reg::RAX;

/// The registers the allocator may hand out. Callee-saved registers come first, as they survive
/// slow-path calls without being spilled to the stack.
pub(super) static ALLOCATABLE: [Reg; 12] = [
    Reg::RBX,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::RSI,
    Reg::RDI,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::RCX,
    Reg::RDX,
];

/// The allocatable registers a SysV call may clobber.
pub(super) static CALLER_SAVED: [Reg; 8] = [
    Reg::RSI,
    Reg::RDI,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::RCX,
    Reg::RDX,
];

/// The registers generated code may modify which the SysV ABI requires the entry trampoline to
/// preserve, in push order.
pub(super) static CALLEE_SAVED: [Reg; 6] = [Reg::RBX, Reg::RBP, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

impl Reg {
    /// Map an iced register of any width onto the 64-bit register containing it.
    pub(super) fn from_iced(r: Register) -> Option<Self> {
        let r = r.full_register();
        Some(match r {
            Register::RAX => Reg::RAX,
            Register::RCX => Reg::RCX,
            Register::RDX => Reg::RDX,
            Register::RBX => Reg::RBX,
            Register::RSP => Reg::RSP,
            Register::RBP => Reg::RBP,
            Register::RSI => Reg::RSI,
            Register::RDI => Reg::RDI,
            Register::R8 => Reg::R8,
            Register::R9 => Reg::R9,
            Register::R10 => Reg::R10,
            Register::R11 => Reg::R11,
            Register::R12 => Reg::R12,
            Register::R13 => Reg::R13,
            Register::R14 => Reg::R14,
            Register::R15 => Reg::R15,
            _ => return None,
        })
    }

    pub(super) fn to_reg8(self) -> Register {
        match self {
            Reg::RAX => Register::AL,
            Reg::RCX => Register::CL,
            Reg::RDX => Register::DL,
            Reg::RBX => Register::BL,
            Reg::RSP => Register::SPL,
            Reg::RBP => Register::BPL,
            Reg::RSI => Register::SIL,
            Reg::RDI => Register::DIL,
            Reg::R8 => Register::R8L,
            Reg::R9 => Register::R9L,
            Reg::R10 => Register::R10L,
            Reg::R11 => Register::R11L,
            Reg::R12 => Register::R12L,
            Reg::R13 => Register::R13L,
            Reg::R14 => Register::R14L,
            Reg::R15 => Register::R15L,
        }
    }

    pub(super) fn to_reg16(self) -> Register {
        match self {
            Reg::RAX => Register::AX,
            Reg::RCX => Register::CX,
            Reg::RDX => Register::DX,
            Reg::RBX => Register::BX,
            Reg::RSP => Register::SP,
            Reg::RBP => Register::BP,
            Reg::RSI => Register::SI,
            Reg::RDI => Register::DI,
            Reg::R8 => Register::R8W,
            Reg::R9 => Register::R9W,
            Reg::R10 => Register::R10W,
            Reg::R11 => Register::R11W,
            Reg::R12 => Register::R12W,
            Reg::R13 => Register::R13W,
            Reg::R14 => Register::R14W,
            Reg::R15 => Register::R15W,
        }
    }

    pub(super) fn to_reg32(self) -> Register {
        match self {
            Reg::RAX => Register::EAX,
            Reg::RCX => Register::ECX,
            Reg::RDX => Register::EDX,
            Reg::RBX => Register::EBX,
            Reg::RSP => Register::ESP,
            Reg::RBP => Register::EBP,
            Reg::RSI => Register::ESI,
            Reg::RDI => Register::EDI,
            Reg::R8 => Register::R8D,
            Reg::R9 => Register::R9D,
            Reg::R10 => Register::R10D,
            Reg::R11 => Register::R11D,
            Reg::R12 => Register::R12D,
            Reg::R13 => Register::R13D,
            Reg::R14 => Register::R14D,
            Reg::R15 => Register::R15D,
        }
    }

    pub(super) fn to_reg64(self) -> Register {
        match self {
            Reg::RAX => Register::RAX,
            Reg::RCX => Register::RCX,
            Reg::RDX => Register::RDX,
            Reg::RBX => Register::RBX,
            Reg::RSP => Register::RSP,
            Reg::RBP => Register::RBP,
            Reg::RSI => Register::RSI,
            Reg::RDI => Register::RDI,
            Reg::R8 => Register::R8,
            Reg::R9 => Register::R9,
            Reg::R10 => Register::R10,
            Reg::R11 => Register::R11,
            Reg::R12 => Register::R12,
            Reg::R13 => Register::R13,
            Reg::R14 => Register::R14,
            Reg::R15 => Register::R15,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}

impl HostReg for Reg {
    fn idx(self) -> usize {
        self as usize
    }
}
