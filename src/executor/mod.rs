//! The symbolic executor adapter: turns a straight-line byte buffer into a
//! `RegisterFile` mapping output registers to `SymExpr`s over the buffer's
//! initial register/stack state.
//!
//! Unlike a full CFG-following disassembler, this executor never follows a
//! branch target: it decodes the given buffer strictly linearly,
//! instruction after instruction. That is what makes "a gadget never
//! enters a callee" a structural property of this module rather than a
//! post-hoc patch, and it is exactly the trick that makes chain solving
//! work by byte concatenation: the bytes placed after one gadget's
//! terminator are the next gadget in the chain, and linear decoding walks
//! straight into them.

mod arm;
mod x86;

use crate::arch::{Arch, RegName};
use crate::error::Result;
use crate::expr::SymExpr;
use std::collections::BTreeMap;

/// The symbolic register state produced by executing a buffer: only
/// registers that were actually written during execution appear here
/// (untouched registers still implicitly hold their identity `Reg(name)`
/// value, but are not enumerated; only locations a block actually
/// assigned to get an entry).
pub struct RegisterFile {
	pub arch: Arch,
	written: BTreeMap<RegName, SymExpr>,
	pub memory_write: bool,
}

impl RegisterFile {
	fn new(arch: Arch) -> Self { RegisterFile { arch, written: BTreeMap::new(), memory_write: false } }

	pub fn read(&self, r: RegName) -> SymExpr {
		self.written.get(&r).cloned().unwrap_or(SymExpr::Reg(r))
	}

	fn write(&mut self, r: RegName, expr: SymExpr) { self.written.insert(r, expr); }

	/// Output registers the buffer actually wrote to, in deterministic
	/// (name-sorted, via the underlying `BTreeMap`) order.
	pub fn outputs(&self) -> impl Iterator<Item = (RegName, &SymExpr)> {
		self.written.iter().map(|(k, v)| (*k, v))
	}
}

/// Executes `bytes` as straight-line code for `arch`, returning the
/// resulting register file, or `SymbolicExecutionFailure` if decoding hit
/// an instruction this crate's executor cannot model.
pub fn execute(bytes: &[u8], arch: Arch, base_addr: u64) -> Result<RegisterFile> {
	match arch {
		Arch::X86 | Arch::X64 => x86::execute(bytes, arch, base_addr),
		Arch::Arm => arm::execute(bytes),
	}
}

/// Decodes `bytes` purely for the scanner's disassembly-filter pass:
/// produces display text and flow-control classification per instruction
/// without needing a register file at all for x86/x64 (iced-x86 already
/// classifies flow control), and reuses the ARM decoder's display path for
/// ARM (see `arm::decode_for_display`).
pub use arm::decode_for_display as arm_decode_for_display;
