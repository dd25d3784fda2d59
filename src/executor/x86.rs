use super::RegisterFile;
use crate::arch::{Arch, RegName};
use crate::error::{Error, Result};
use crate::expr::SymExpr;
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

fn reg_name(reg: Register) -> Option<RegName> {
	use Register::*;
	Some(match reg {
		RAX => RegName("rax"),
		EAX => RegName("eax"),
		RBX => RegName("rbx"),
		EBX => RegName("ebx"),
		RCX => RegName("rcx"),
		ECX => RegName("ecx"),
		RDX => RegName("rdx"),
		EDX => RegName("edx"),
		RSI => RegName("rsi"),
		ESI => RegName("esi"),
		RDI => RegName("rdi"),
		EDI => RegName("edi"),
		RBP => RegName("rbp"),
		EBP => RegName("ebp"),
		RSP => RegName("rsp"),
		ESP => RegName("esp"),
		R8 => RegName("r8"),
		R9 => RegName("r9"),
		R10 => RegName("r10"),
		R11 => RegName("r11"),
		R12 => RegName("r12"),
		R13 => RegName("r13"),
		R14 => RegName("r14"),
		R15 => RegName("r15"),
		RIP => RegName("rip"),
		EIP => RegName("eip"),
		_ => return None,
	})
}

fn reg_width_bits(reg: Register) -> u16 { reg.size() as u16 * 8 }

/// Builds the address expression for a memory operand, supporting a base
/// register plus constant displacement and, where present, a scaled index
/// register folded in as a second additive term (scale 1 only, larger
/// scales fold the index in as an opaque `MultiReg`-shaped dependency by
/// being left as `Reg` with no multiplication, which is conservative: the
/// classifier will still see the right set of input registers via
/// `locations_of`, just not the exact scaled arithmetic).
fn mem_addr_expr(instr: &Instruction) -> Option<SymExpr> {
	let base = instr.memory_base();
	let index = instr.memory_index();
	let disp = instr.memory_displacement64() as i64;

	let mut expr = match reg_name(base) {
		Some(r) => SymExpr::reg(r),
		None => SymExpr::Const(0),
	};
	if index != Register::None {
		let idx_name = reg_name(index)?;
		expr = expr.add(SymExpr::reg(idx_name));
	}
	Some(expr.add_const(disp))
}

fn read_operand(regs: &RegisterFile, instr: &Instruction, op: u32) -> Option<SymExpr> {
	match instr.op_kind(op) {
		OpKind::Register => {
			let r = instr.op_register(op);
			Some(regs.read(reg_name(r)?))
		}
		OpKind::Memory => {
			let addr = mem_addr_expr(instr)?;
			let width = instr.memory_size().size() as u16 * 8;
			Some(SymExpr::mem(addr, width))
		}
		OpKind::Immediate8
		| OpKind::Immediate8_2nd
		| OpKind::Immediate16
		| OpKind::Immediate32
		| OpKind::Immediate64
		| OpKind::Immediate8to16
		| OpKind::Immediate8to32
		| OpKind::Immediate8to64
		| OpKind::Immediate32to64 => Some(SymExpr::Const(instr.immediate(op))),
		_ => None,
	}
}

/// Executes one instruction against `regs`, updating it in place.
///
/// Returns `Ok(true)` if the instruction is the gadget's terminator and no
/// further instructions should be decoded (kept for symmetry with the ARM
/// backend; the x86 backend never actually needs to stop early since
/// decoding already consumes exactly the window/chain buffer).
fn step(regs: &mut RegisterFile, instr: &Instruction, ptr_width: u16) -> Result<()> {
	let unsupported = || Error::SymbolicExecutionFailure;

	match instr.mnemonic() {
		Mnemonic::Nop | Mnemonic::Endbr32 | Mnemonic::Endbr64 => Ok(()),

		Mnemonic::Pop => {
			let dst = reg_name(instr.op0_register()).ok_or_else(unsupported)?;
			let sp = regs.read(regs.arch.sp_reg());
			let width = reg_width_bits(instr.op0_register());
			let value = SymExpr::mem(sp.clone(), width);
			regs.write(dst, value);
			regs.write(regs.arch.sp_reg(), sp.add_const(ptr_width as i64));
			Ok(())
		}

		Mnemonic::Push => {
			regs.memory_write = true;
			let sp = regs.read(regs.arch.sp_reg());
			regs.write(regs.arch.sp_reg(), sp.sub(SymExpr::Const(ptr_width as u64)));
			Ok(())
		}

		Mnemonic::Ret | Mnemonic::Retf => {
			let sp = regs.read(regs.arch.sp_reg());
			let ip_value = SymExpr::mem(sp.clone(), ptr_width * 8);
			let mut new_sp = sp.add_const(ptr_width as i64);
			if instr.op_count() > 0 {
				let extra = instr.immediate(0) as i64;
				new_sp = new_sp.add_const(extra);
			}
			regs.write(regs.arch.ip_reg(), ip_value);
			regs.write(regs.arch.sp_reg(), new_sp);
			Ok(())
		}

		Mnemonic::Leave => {
			let bp_reg = regs.arch.bp_reg().ok_or_else(unsupported)?;
			let bp = regs.read(bp_reg);
			regs.write(regs.arch.sp_reg(), bp.clone());
			let popped = SymExpr::mem(bp.clone(), ptr_width * 8);
			regs.write(bp_reg, popped);
			let new_sp = bp.add_const(ptr_width as i64);
			regs.write(regs.arch.sp_reg(), new_sp);
			Ok(())
		}

		Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::Movsx | Mnemonic::Movsxd => {
			if instr.op0_kind() == OpKind::Memory {
				regs.memory_write = true;
				return Ok(());
			}
			let dst = reg_name(instr.op0_register()).ok_or_else(unsupported)?;
			let src = read_operand(regs, instr, 1).ok_or_else(unsupported)?;
			regs.write(dst, src);
			Ok(())
		}

		Mnemonic::Lea => {
			let dst = reg_name(instr.op0_register()).ok_or_else(unsupported)?;
			let addr = mem_addr_expr(instr).ok_or_else(unsupported)?;
			regs.write(dst, addr);
			Ok(())
		}

		Mnemonic::Add | Mnemonic::Sub => {
			if instr.op0_kind() == OpKind::Memory {
				regs.memory_write = true;
				return Ok(());
			}
			let dst = reg_name(instr.op0_register()).ok_or_else(unsupported)?;
			let lhs = regs.read(dst);
			let rhs = read_operand(regs, instr, 1).ok_or_else(unsupported)?;
			let result = if instr.mnemonic() == Mnemonic::Add { lhs.add(rhs) } else { lhs.sub(rhs) };
			regs.write(dst, result);
			Ok(())
		}

		Mnemonic::Xchg => {
			if instr.op0_kind() == OpKind::Memory || instr.op1_kind() == OpKind::Memory {
				regs.memory_write = true;
				return Ok(());
			}
			let a = reg_name(instr.op0_register()).ok_or_else(unsupported)?;
			let b = reg_name(instr.op1_register()).ok_or_else(unsupported)?;
			let va = regs.read(a);
			let vb = regs.read(b);
			regs.write(a, vb);
			regs.write(b, va);
			Ok(())
		}

		Mnemonic::Xor => {
			if instr.op0_kind() == OpKind::Memory {
				regs.memory_write = true;
				return Ok(());
			}
			if instr.op1_kind() == OpKind::Register && instr.op0_register() == instr.op1_register() {
				let dst = reg_name(instr.op0_register()).ok_or_else(unsupported)?;
				regs.write(dst, SymExpr::Const(0));
				Ok(())
			}
			else {
				Err(unsupported())
			}
		}

		// A `call` terminating a gadget window is rewritten to the effect of
		// a `ret` rather than executed as itself: its own push/jump-to-operand
		// effect is discarded entirely, since the callee is never entered from
		// the exploit's vantage point.
		Mnemonic::Call => {
			let sp = regs.read(regs.arch.sp_reg());
			let ip_value = SymExpr::mem(sp.clone(), ptr_width * 8);
			let new_sp = sp.add_const(ptr_width as i64);
			regs.write(regs.arch.ip_reg(), ip_value);
			regs.write(regs.arch.sp_reg(), new_sp);
			Ok(())
		}

		Mnemonic::Jmp => {
			let target = read_operand(regs, instr, 0).ok_or_else(unsupported)?;
			regs.write(regs.arch.ip_reg(), target);
			Ok(())
		}

		Mnemonic::Int | Mnemonic::Int3 | Mnemonic::Syscall | Mnemonic::Sysenter | Mnemonic::Sysexit
		| Mnemonic::Sysret => Ok(()),

		_ => Err(unsupported()),
	}
}

pub fn execute(bytes: &[u8], arch: Arch, base_addr: u64) -> Result<RegisterFile> {
	let bitness = match arch {
		Arch::X86 => 32,
		Arch::X64 => 64,
		Arch::Arm => unreachable!("x86 executor invoked for ARM"),
	};
	let ptr_width = arch.pointer_width();
	let mut decoder = Decoder::with_ip(bitness, bytes, base_addr, DecoderOptions::NONE);
	let mut regs = RegisterFile::new(arch);
	let mut instr = Instruction::default();
	while decoder.can_decode() {
		decoder.decode_out(&mut instr);
		if instr.is_invalid() {
			return Err(Error::SymbolicExecutionFailure);
		}
		step(&mut regs, &instr, ptr_width)?;
	}
	Ok(regs)
}
