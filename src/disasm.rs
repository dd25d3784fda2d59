//! The disassembly wrapper and multi-branch filter (`pass_clean`).

use crate::arch::Arch;
use crate::executor::arm_decode_for_display;
use iced_x86::{Decoder, DecoderOptions, FlowControl, Formatter, Instruction, NasmFormatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
	None,
	Jump,
	Call,
	Return,
	Interrupt,
	IRet,
}

impl BranchKind {
	fn is_branch_category(&self) -> bool { !matches!(self, BranchKind::None) }
}

#[derive(Debug, Clone)]
pub struct DecodedInsn {
	pub text: String,
	pub branch_kind: BranchKind,
	/// `true` for the ARM `pop {..., pc}` shape, which some disassemblers
	/// (and this crate's own minimal ARM decoder) do not classify as a
	/// branch outright.
	pub is_pop_pc: bool,
}

impl DecodedInsn {
	fn mnemonic(&self) -> &str { self.text.split_whitespace().next().unwrap_or("") }
}

fn flow_control_kind(instr: &Instruction) -> BranchKind {
	use iced_x86::Mnemonic::*;
	match instr.mnemonic() {
		Iret | Iretd | Iretq => return BranchKind::IRet,
		Int | Int3 | Into => return BranchKind::Interrupt,
		_ => {}
	}
	match instr.flow_control() {
		FlowControl::Next => BranchKind::None,
		FlowControl::UnconditionalBranch | FlowControl::IndirectBranch | FlowControl::ConditionalBranch => {
			BranchKind::Jump
		}
		FlowControl::Call | FlowControl::IndirectCall => BranchKind::Call,
		FlowControl::Return => BranchKind::Return,
		FlowControl::Interrupt => BranchKind::Interrupt,
		FlowControl::XbeginXabortXend | FlowControl::Exception => BranchKind::None,
	}
}

/// Decodes `bytes` (a candidate gadget window) at virtual address `vaddr`.
/// Returns `None` if decoding does not fully consume the window, or hits
/// an invalid instruction anywhere in it.
pub fn decode_window(bytes: &[u8], vaddr: u64, arch: Arch) -> Option<Vec<DecodedInsn>> {
	match arch {
		Arch::X86 | Arch::X64 => decode_window_x86(bytes, vaddr, arch),
		Arch::Arm => decode_window_arm(bytes),
	}
}

fn decode_window_x86(bytes: &[u8], vaddr: u64, arch: Arch) -> Option<Vec<DecodedInsn>> {
	let bitness = match arch {
		Arch::X86 => 32,
		Arch::X64 => 64,
		Arch::Arm => unreachable!(),
	};
	let mut decoder = Decoder::with_ip(bitness, bytes, vaddr, DecoderOptions::NONE);
	let mut formatter = NasmFormatter::new();
	formatter.options_mut().set_space_after_operand_separator(true);
	let mut out = Vec::new();
	let mut instr = Instruction::default();
	while decoder.can_decode() {
		decoder.decode_out(&mut instr);
		if instr.is_invalid() {
			return None;
		}
		let mut text = String::new();
		formatter.format(&instr, &mut text);
		out.push(DecodedInsn { text, branch_kind: flow_control_kind(&instr), is_pop_pc: false });
	}
	if decoder.position() != bytes.len() {
		return None;
	}
	Some(out)
}

fn decode_window_arm(bytes: &[u8]) -> Option<Vec<DecodedInsn>> {
	if bytes.len() % 4 != 0 {
		return None;
	}
	let decoded = arm_decode_for_display(bytes).ok()?;
	Some(
		decoded
			.into_iter()
			.map(|(text, is_pop_pc)| {
				let branch_kind = if is_pop_pc {
					// ARM pop-into-pc is classified as a load by the disassembler,
					// not a branch; branch_count's +1 exception for a trailing pop
					// mnemonic accounts for it instead, so it must not also land in
					// a branch category here (that would double-count it and make
					// pass_clean reject it).
					BranchKind::None
				}
				else if text.starts_with('b') || text.starts_with("bx") || text.starts_with("blx") {
					BranchKind::Jump
				}
				else if text.starts_with("svc") {
					BranchKind::Interrupt
				}
				else {
					BranchKind::None
				};
				DecodedInsn { text, branch_kind, is_pop_pc }
			})
			.collect(),
	)
}

fn branch_count(insns: &[DecodedInsn]) -> usize {
	let mut count = insns.iter().filter(|i| i.branch_kind.is_branch_category()).count();
	if insns.last().map(|i| i.mnemonic() == "pop").unwrap_or(false) {
		count += 1;
	}
	count
}

/// A candidate is accepted only if its last instruction is a terminator
/// (branch category, or the ARM `pop {..., pc}` shape) and at most one
/// branching instruction appears in the window.
pub fn pass_clean(insns: &[DecodedInsn]) -> bool {
	let Some(last) = insns.last()
	else {
		return false;
	};
	let is_terminator = last.branch_kind.is_branch_category() || last.is_pop_pc;
	if !is_terminator {
		return false;
	}
	branch_count(insns) <= 1
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pop_rdi_ret_x64_is_clean() {
		let bytes = [0x5f, 0xc3];
		let insns = decode_window(&bytes, 0x400000, Arch::X64).expect("decodes");
		assert_eq!(insns.len(), 2);
		assert!(pass_clean(&insns));
	}

	#[test]
	fn double_ret_is_rejected_by_multi_branch() {
		let bytes = [0x5f, 0xc3, 0xc3];
		let insns = decode_window(&bytes, 0x400000, Arch::X64).expect("decodes");
		assert_eq!(insns.len(), 3);
		assert!(!pass_clean(&insns));
	}

	#[test]
	fn arm_pop_pc_is_clean() {
		let bytes = [0x10, 0x80, 0xBD, 0xE8];
		let insns = decode_window(&bytes, 0x10000, Arch::Arm).expect("decodes");
		assert_eq!(insns.len(), 1);
		assert!(pass_clean(&insns));
	}
}
