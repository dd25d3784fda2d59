use super::RegisterFile;
use crate::arch::{Arch, RegName};
use crate::error::{Error, Result};
use crate::expr::SymExpr;

/// A minimal ARMv7 (ARM-mode only, no Thumb interworking) instruction
/// decoder covering the data-processing, single-register load, and
/// load/store-multiple shapes that occur as ROP gadget bodies.
///
/// This is not a general disassembler: it decodes exactly the bitfields
/// needed to (a) produce a human-readable mnemonic string for the gadget's
/// `insns` field and (b) update the symbolic register file. Anything
/// outside this subset reports `SymbolicExecutionFailure`, this crate's
/// non-fatal drop for a gadget the executor cannot model.
fn reg_name(n: u32) -> Option<RegName> {
	const NAMES: [&str; 16] = [
		"r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
		"pc",
	];
	NAMES.get(n as usize).map(|s| RegName(s))
}

fn cond_suffix(word: u32) -> &'static str {
	match word >> 28 {
		0x0 => "eq",
		0x1 => "ne",
		0x2 => "cs",
		0x3 => "cc",
		0x4 => "mi",
		0x5 => "pl",
		0x6 => "vs",
		0x7 => "vc",
		0x8 => "hi",
		0x9 => "ls",
		0xA => "ge",
		0xB => "lt",
		0xC => "gt",
		0xD => "le",
		0xE => "",
		_ => "<unpredictable>",
	}
}

struct Decoded {
	text: String,
	is_pop_pc: bool,
}

fn decode_one(word: u32, regs: &mut RegisterFile) -> Result<Decoded> {
	let unsupported = || Error::SymbolicExecutionFailure;
	let cond = cond_suffix(word);

	// SVC / SWI: cond 1111 imm24
	if (word >> 24) & 0xF == 0xF {
		let imm = word & 0x00FF_FFFF;
		return Ok(Decoded { text: format!("svc{cond} {imm:#x}"), is_pop_pc: false });
	}

	// Branch: cond 101L imm24
	if (word >> 25) & 0x7 == 0x5 {
		let link = (word >> 24) & 1 == 1;
		let mnem = if link { "bl" } else { "b" };
		return Ok(Decoded { text: format!("{mnem}{cond} #imm"), is_pop_pc: false });
	}

	// BX/BLX register: cond 0001 0010 1111 1111 1111 00L1 Rm
	if (word & 0x0FFF_FFD0) == 0x012F_FF10 {
		let link = (word >> 5) & 1 == 1;
		let rm = reg_name(word & 0xF).ok_or_else(unsupported)?;
		let mnem = if link { "blx" } else { "bx" };
		regs.write(regs.arch.ip_reg(), regs.read(rm));
		return Ok(Decoded { text: format!("{mnem}{cond} {rm}"), is_pop_pc: false });
	}

	// LDM/STM (load/store multiple), including `pop`/`push` aliases:
	// cond 100P USWL Rn {reglist}
	if (word >> 25) & 0x7 == 0x4 {
		let load = (word >> 20) & 1 == 1;
		let writeback = (word >> 21) & 1 == 1;
		let rn = (word >> 16) & 0xF;
		let reglist = word & 0xFFFF;
		let is_pop = load && rn == 13 && writeback && (word >> 23) & 1 == 1 && (word >> 24) & 1 == 0;

		if !load {
			regs.memory_write = true;
			return Ok(Decoded { text: "stm".to_string(), is_pop_pc: false });
		}

		let rn_name = reg_name(rn).ok_or_else(unsupported)?;
		let mut addr = regs.read(rn_name);
		let mut names = Vec::new();
		let mut touches_pc = false;
		for i in 0..16 {
			if (reglist >> i) & 1 == 1 {
				let r = reg_name(i).ok_or_else(unsupported)?;
				names.push(r.to_string());
				if r == RegName("pc") {
					touches_pc = true;
					regs.write(regs.arch.ip_reg(), SymExpr::mem(addr.clone(), 32));
				}
				else {
					regs.write(r, SymExpr::mem(addr.clone(), 32));
				}
				addr = addr.add_const(4);
			}
		}
		if writeback {
			regs.write(rn_name, addr);
		}
		let mnem = if is_pop { "pop" } else { "ldm" };
		let text = format!("{mnem}{cond} {{{}}}", names.join(", "));
		return Ok(Decoded { text, is_pop_pc: is_pop && touches_pc });
	}

	// Single data transfer (LDR/STR, immediate offset only):
	// cond 01IPUBWL Rn Rd imm12
	if (word >> 26) & 0x3 == 0x1 {
		let load = (word >> 20) & 1 == 1;
		let up = (word >> 23) & 1 == 1;
		let rn = (word >> 16) & 0xF;
		let rd = (word >> 12) & 0xF;
		let imm12 = (word & 0xFFF) as i64;
		let disp = if up { imm12 } else { -imm12 };

		if !load {
			regs.memory_write = true;
			return Ok(Decoded { text: "str".to_string(), is_pop_pc: false });
		}

		let rn_name = reg_name(rn).ok_or_else(unsupported)?;
		let rd_name = reg_name(rd).ok_or_else(unsupported)?;
		let addr = regs.read(rn_name).add_const(disp);
		if rd_name == RegName("pc") {
			regs.write(regs.arch.ip_reg(), SymExpr::mem(addr, 32));
		}
		else {
			regs.write(rd_name, SymExpr::mem(addr, 32));
		}
		return Ok(Decoded {
			text: format!("ldr{cond} {rd_name}, [{rn_name}, #{disp}]"),
			is_pop_pc: false,
		});
	}

	// Data-processing (MOV/MVN/ADD/SUB/AND/ORR/EOR), register or
	// immediate second operand: cond 00I OOOOS Rn Rd operand2
	if (word >> 26) & 0x3 == 0x0 {
		let immediate_operand = (word >> 25) & 1 == 1;
		let opcode = (word >> 21) & 0xF;
		let rn = (word >> 16) & 0xF;
		let rd = (word >> 12) & 0xF;
		let rd_name = reg_name(rd).ok_or_else(unsupported)?;

		let op2 = if immediate_operand {
			let imm8 = word & 0xFF;
			let rot = ((word >> 8) & 0xF) * 2;
			SymExpr::Const((imm8.rotate_right(rot)) as u64)
		}
		else {
			if (word >> 4) & 0x1 == 1 {
				// register-shifted-register operand2: not modeled.
				return Err(unsupported());
			}
			let rm = reg_name(word & 0xF).ok_or_else(unsupported)?;
			let shift_imm = (word >> 7) & 0x1F;
			if shift_imm != 0 {
				return Err(unsupported());
			}
			regs.read(rm)
		};

		let rn_name = reg_name(rn);
		let (mnem, result) = match opcode {
			0xD => ("mov", op2.clone()),                                   // MOV
			0xF => return Err(unsupported()),                              // MVN: not modeled
			0x4 => ("add", regs.read(rn_name.ok_or_else(unsupported)?).add(op2.clone())), // ADD
			0x2 => ("sub", regs.read(rn_name.ok_or_else(unsupported)?).sub(op2.clone())), // SUB
			_ => return Err(unsupported()),
		};
		if rd_name == RegName("pc") {
			regs.write(regs.arch.ip_reg(), result);
		}
		else {
			regs.write(rd_name, result);
		}
		let operand_text =
			if immediate_operand { "#imm".to_string() } else { "reg".to_string() };
		return Ok(Decoded { text: format!("{mnem}{cond} {rd_name}, {operand_text}"), is_pop_pc: false });
	}

	Err(unsupported())
}

pub fn execute(bytes: &[u8]) -> Result<RegisterFile> {
	if bytes.len() % 4 != 0 {
		return Err(Error::SymbolicExecutionFailure);
	}
	let mut regs = RegisterFile::new(Arch::Arm);
	for chunk in bytes.chunks_exact(4) {
		let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
		decode_one(word, &mut regs)?;
	}
	Ok(regs)
}

/// Decodes `bytes` purely for display purposes (used by the disassembly
/// filter, which needs `insns` text and the `is_pop_pc` special case before
/// any register-file mutation is wanted).
pub fn decode_for_display(bytes: &[u8]) -> Result<Vec<(String, bool)>> {
	let mut scratch = RegisterFile::new(Arch::Arm);
	let mut out = Vec::new();
	for chunk in bytes.chunks_exact(4) {
		let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
		let decoded = decode_one(word, &mut scratch)?;
		out.push((decoded.text, decoded.is_pop_pc));
	}
	Ok(out)
}
