//! A table-driven guest for tests.
//!
//! Programs are a map from address to [Decoded] instruction. Memory is a [FastmemWindow] of RAM
//! starting at 0; addresses above RAM are "MMIO": reads return [MMIO_VALUE] and both reads and
//! writes are recorded.

use crate::{
    fastmem::FastmemWindow,
    guest::{
        AccessWidth, Decoded, Guest, GuestAddr, GuestException, GuestReg, GuestState, Inst,
    },
};
use std::{collections::HashMap, ptr::NonNull};

/// The bytes of RAM a [TestGuest] has.
pub(crate) const RAM_SIZE: usize = 0x1_0000;
/// What an MMIO read returns.
pub(crate) const MMIO_VALUE: u32 = 0x1234_5678;
/// Where [TestGuest::raise_exception] sends the guest.
pub(crate) const VECTOR: GuestAddr = 0x8000;
/// [Inst::Interpret] words below this add one to the GPR they name. Others raise
/// [GuestException::Program].
pub(crate) const INTERPRET_INC_LIMIT: u32 = 32;

pub(crate) struct TestGuest {
    pub(crate) prog: HashMap<GuestAddr, Decoded>,
    pub(crate) mem: FastmemWindow,
    /// Should [Guest::fastmem_base] return the window?
    pub(crate) fastmem: bool,
    pub(crate) mmio_reads: Vec<GuestAddr>,
    pub(crate) mmio_writes: Vec<(GuestAddr, u32)>,
    /// Every [Guest::decode] call.
    pub(crate) decodes: Vec<GuestAddr>,
    /// Every exception delivered, with the pc it was raised at.
    pub(crate) exceptions: Vec<(GuestAddr, GuestException)>,
    pub(crate) interpreted: Vec<(GuestAddr, u32)>,
    /// The total passed to [Guest::advance_time].
    pub(crate) elapsed: u64,
}

impl TestGuest {
    pub(crate) fn new() -> Self {
        Self {
            prog: HashMap::new(),
            mem: FastmemWindow::new(RAM_SIZE).unwrap(),
            fastmem: true,
            mmio_reads: Vec::new(),
            mmio_writes: Vec::new(),
            decodes: Vec::new(),
            exceptions: Vec::new(),
            interpreted: Vec::new(),
            elapsed: 0,
        }
    }

    /// Place `insts` at `start`, each 4 bytes long and costing 1 cycle.
    pub(crate) fn program(mut self, start: GuestAddr, insts: &[Inst]) -> Self {
        self.load(start, insts);
        self
    }

    pub(crate) fn load(&mut self, start: GuestAddr, insts: &[Inst]) {
        for (i, inst) in insts.iter().enumerate() {
            self.prog.insert(
                start + 4 * i as GuestAddr,
                Decoded {
                    inst: *inst,
                    len: 4,
                    cycles: 1,
                },
            );
        }
    }

    pub(crate) fn without_fastmem(mut self) -> Self {
        self.fastmem = false;
        self
    }

    pub(crate) fn read_ram(&self, addr: GuestAddr) -> u32 {
        let a = addr as usize;
        u32::from_le_bytes(self.mem.ram()[a..a + 4].try_into().unwrap())
    }

    pub(crate) fn write_ram(&mut self, addr: GuestAddr, val: u32) {
        let a = addr as usize;
        self.mem.ram_mut()[a..a + 4].copy_from_slice(&val.to_le_bytes());
    }
}

impl Guest for TestGuest {
    fn decode(&mut self, addr: GuestAddr) -> Result<Decoded, GuestException> {
        self.decodes.push(addr);
        self.prog
            .get(&addr)
            .copied()
            .ok_or(GuestException::InstructionFetch)
    }

    fn read(&mut self, addr: GuestAddr, width: AccessWidth) -> u32 {
        match self.mem.translate(addr, width) {
            Some(_) => {
                let a = addr as usize;
                let mut b = [0; 4];
                b[..width.bytes()].copy_from_slice(&self.mem.ram()[a..a + width.bytes()]);
                u32::from_le_bytes(b)
            }
            None => {
                self.mmio_reads.push(addr);
                width.extend(MMIO_VALUE, false)
            }
        }
    }

    fn write(&mut self, addr: GuestAddr, width: AccessWidth, val: u32) {
        match self.mem.translate(addr, width) {
            Some(_) => {
                let a = addr as usize;
                let b = val.to_le_bytes();
                self.mem.ram_mut()[a..a + width.bytes()].copy_from_slice(&b[..width.bytes()]);
            }
            None => self.mmio_writes.push((addr, width.extend(val, false))),
        }
    }

    fn translate(&mut self, addr: GuestAddr, width: AccessWidth) -> Option<NonNull<u8>> {
        self.mem.translate(addr, width)
    }

    fn fastmem_base(&self) -> Option<NonNull<u8>> {
        self.fastmem.then(|| self.mem.base())
    }

    fn raise_exception(&mut self, state: &mut GuestState, exc: GuestException) {
        self.exceptions.push((state.pc, exc));
        state.lr = state.pc;
        state.pc = VECTOR;
    }

    fn advance_time(&mut self, _state: &mut GuestState, elapsed: u32) {
        self.elapsed += u64::from(elapsed);
    }

    fn interpret(&mut self, state: &mut GuestState, pc: GuestAddr, word: u32) {
        self.interpreted.push((pc, word));
        if word < INTERPRET_INC_LIMIT {
            let r = GuestReg::Gpr(word as u8);
            state.write(r, state.read(r) + 1);
        } else {
            state.set_exception(GuestException::Program);
        }
    }
}
