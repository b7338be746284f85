//! The x64 assembler. Uses [iced_x86] to encode instructions.
//!
//! Code is assembled forwards into a scratch buffer whose eventual host address is known up
//! front, so that branches to fixed addresses (the exit stub, trampolines, resume points) can be
//! encoded immediately. Branches to labels are encoded with a dummy target and fixed up by
//! [Asm::finish] once every label has been bound.

use crate::compile::CompilationError;
use iced_x86::{
    Decoder, DecoderOptions, Encoder, Formatter, IcedError, Instruction as Op, NasmFormatter,
};
use index_vec::{IndexVec, index_vec};

pub(super) struct Asm {
    /// The host address the first byte of [Self::buf] will end up at.
    base: usize,
    buf: Vec<u8>,
    /// A scratch encoder, reused to avoid reallocations.
    enc: Encoder,
    /// Labels. New labels start with a value of `None`; when they are bound to an offset, this
    /// becomes `Some(...)`.
    labels: IndexVec<LabelIdx, Option<usize>>,
    /// Branches to labels which need relocating, as `(offset, instruction length, label)`.
    relocs: Vec<(usize, usize, LabelIdx)>,
    /// The first encoding failure, if any. Reported by [Self::finish].
    err: Option<String>,
}

impl Asm {
    pub(super) fn new(base: usize) -> Self {
        Asm {
            base,
            buf: Vec::with_capacity(256),
            enc: Encoder::new(64),
            labels: index_vec![],
            relocs: Vec::new(),
            err: None,
        }
    }

    /// The number of bytes assembled so far.
    pub(super) fn len(&self) -> usize {
        self.buf.len()
    }

    /// The host address of the next byte to be assembled.
    pub(super) fn addr(&self) -> usize {
        self.base + self.buf.len()
    }

    /// Create a new free-floating label: it will only be attached when `bind` is called on it.
    pub(super) fn mk_label(&mut self) -> LabelIdx {
        self.labels.push(None)
    }

    /// Attach `lidx` to the next assembled byte.
    pub(super) fn bind(&mut self, lidx: LabelIdx) {
        debug_assert!(self.labels[lidx].is_none());
        self.labels[lidx] = Some(self.buf.len());
    }

    /// Push raw bytes.
    pub(super) fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Push `n` bytes of `nop` instructions.
    pub(super) fn push_nops(&mut self, mut n: usize) {
        while n > 0 {
            let bytes = nops(n);
            self.buf.extend_from_slice(bytes);
            n -= bytes.len();
        }
    }

    /// Push an icedx64 [Op]. Near branches may target any fixed host address.
    pub(super) fn push_inst(&mut self, op: Result<Op, IcedError>) {
        let ip = self.addr() as u64;
        let r = op.and_then(|inst| self.enc.encode(&inst, ip));
        match r {
            Ok(_) => {
                let enc_buf = self.enc.take_buffer();
                self.buf.extend_from_slice(&enc_buf);
                let mut enc_buf = enc_buf;
                enc_buf.clear();
                self.enc.set_buffer(enc_buf);
            }
            Err(e) => {
                if self.err.is_none() {
                    self.err = Some(format!("at {ip:#x}: {e}"));
                }
            }
        }
    }

    /// Push a near JMP or JCC `op` whose target is the label `lidx`. `op` must have been created
    /// with a target of 0.
    pub(super) fn push_label_branch(&mut self, op: Result<Op, IcedError>, lidx: LabelIdx) {
        // iced won't encode a branch to 0, so point it at itself: the rel32 form is always used
        // for `*_rel32_64` codes, and the displacement is overwritten by `finish`.
        let ip = self.addr() as u64;
        let op = op.map(|mut inst| {
            inst.set_near_branch64(ip);
            inst
        });
        let off = self.buf.len();
        self.push_inst(op);
        self.relocs.push((off, self.buf.len() - off, lidx));
    }

    /// Resolve label references and return the assembled bytes.
    pub(super) fn finish(mut self) -> Result<Vec<u8>, CompilationError> {
        if let Some(e) = self.err.take() {
            return Err(CompilationError::InternalError(e));
        }
        for &(off, inst_len, lidx) in &self.relocs {
            let target = self.labels[lidx].ok_or_else(|| {
                CompilationError::InternalError(format!("label {lidx:?} never bound"))
            })?;
            // We examine the instruction to see which part of it holds the displacement.
            let patch_off = if self.buf[off] == 0xE9 {
                off + 1 // JMP
            } else if self.buf[off] == 0x0F && (0x80..=0x8F).contains(&self.buf[off + 1]) {
                off + 2 // JCC
            } else {
                return Err(CompilationError::InternalError(format!(
                    "cannot relocate {:X?}",
                    &self.buf[off..off + inst_len]
                )));
            };
            let diff = target as i64 - (off + inst_len) as i64;
            let diff = i32::try_from(diff)
                .map_err(|_| CompilationError::InternalError("branch out of range".into()))?;
            self.buf[patch_off..patch_off + 4].copy_from_slice(&diff.to_le_bytes());
        }
        Ok(self.buf)
    }
}

/// The bytes of a `jmp rel32` at `from` to `to`.
pub(super) fn jmp_rel32(from: usize, to: usize) -> [u8; 5] {
    let diff = i32::try_from(to as i64 - (from as i64 + 5))
        .expect("code buffer regions are within rel32 range");
    let mut b = [0xE9, 0, 0, 0, 0];
    b[1..].copy_from_slice(&diff.to_le_bytes());
    b
}

/// If `code` starts with a `jmp rel32`, located at `at`, return its target.
pub(super) fn jmp_rel32_target(at: usize, code: &[u8]) -> Option<usize> {
    match code {
        [0xE9, d @ ..] if d.len() >= 4 => {
            let diff = i32::from_le_bytes([d[0], d[1], d[2], d[3]]);
            Some((at as i64 + 5 + i64::from(diff)) as usize)
        }
        _ => None,
    }
}

/// The longest single-instruction nop that fits in `n > 0` bytes.
fn nops(n: usize) -> &'static [u8] {
    // From https://en.wikipedia.org/wiki/NOP_(code)
    match n {
        1 => &[0x90],
        2 => &[0x66, 0x90],
        3 => &[0x0F, 0x1F, 0x00],
        4 => &[0x0F, 0x1F, 0x40, 0x00],
        5 => &[0x0F, 0x1F, 0x44, 0x00, 0x00],
        6 => &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
        7 => &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
        8 => &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        _ => &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    }
}

/// Decode the single instruction at the start of `code`, which lives at host address `ip`.
pub(super) fn decode_one(code: &[u8], ip: usize) -> Op {
    Decoder::with_ip(64, code, ip as u64, DecoderOptions::NONE).decode()
}

/// Render `code`, which lives at host address `ip`, as one instruction per line.
pub(super) fn disassemble(code: &[u8], ip: usize) -> String {
    let mut fmtr = NasmFormatter::new();
    fmtr.options_mut().set_branch_leading_zeros(false);
    fmtr.options_mut().set_hex_prefix("0x");
    fmtr.options_mut().set_hex_suffix("");
    fmtr.options_mut().set_rip_relative_addresses(true);
    fmtr.options_mut().set_show_branch_size(false);
    fmtr.options_mut().set_space_after_operand_separator(true);
    let mut dec = Decoder::with_ip(64, code, ip as u64, DecoderOptions::NONE);
    let mut out = String::new();
    let mut s = String::new();
    let mut inst = Op::default();
    while dec.can_decode() {
        dec.decode_out(&mut inst);
        s.clear();
        fmtr.format(&inst, &mut s);
        out.push_str(&format!("{:x}: {s}\n", inst.ip()));
    }
    out
}

index_vec::define_index_type! {
    pub(crate) struct LabelIdx = u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm::FMBuilder;
    use iced_x86::{Code, Register};

    #[test]
    fn forward_and_backward_labels() {
        let base = 0x10_0000;
        let mut asm = Asm::new(base);
        let top = asm.mk_label();
        let out = asm.mk_label();
        asm.bind(top);
        asm.push_inst(Op::with2(Code::Cmp_rm32_r32, Register::EBX, Register::ECX));
        asm.push_label_branch(Op::with_branch(Code::Je_rel32_64, 0), out);
        asm.push_inst(Op::with1(Code::Inc_rm32, Register::EBX));
        asm.push_label_branch(Op::with_branch(Code::Jmp_rel32_64, 0), top);
        asm.bind(out);
        asm.push_inst(Ok(Op::with(Code::Retnq)));
        let code = asm.finish().unwrap();
        let fm = FMBuilder::new(
            "100000: cmp ebx, ecx
100002: je 0x10000f
100008: inc ebx
10000a: jmp 0x100000
10000f: ret
",
        )
        .unwrap()
        .build()
        .unwrap();
        fm.matches(&disassemble(&code, base)).unwrap();
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut asm = Asm::new(0x1000);
        let l = asm.mk_label();
        asm.push_label_branch(Op::with_branch(Code::Jmp_rel32_64, 0), l);
        assert!(asm.finish().is_err());
    }

    #[test]
    fn rel32_jumps() {
        let b = jmp_rel32(0x1000, 0x900);
        assert_eq!(jmp_rel32_target(0x1000, &b), Some(0x900));
        assert_eq!(jmp_rel32_target(0x1000, &[0x90; 5]), None);
        let mut asm = Asm::new(0);
        asm.push_nops(12);
        assert_eq!(asm.len(), 12);
    }
}
