//! The classifier. Consumes an unclassified `Gadget` from the scanner and
//! derives `regs`/`sp_delta`, or rejects it.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::executor;
use crate::expr::SymExpr;
use crate::gadget::{Gadget, MemBase, MemRef, RegEffect};
use std::collections::BTreeMap;

pub struct Classifier {
	arch: Arch,
}

impl Classifier {
	pub fn new(arch: Arch) -> Self { Classifier { arch } }

	/// Classifies `gadget`, returning a new `Gadget` with `regs`/`sp_delta`
	/// populated, or an error the caller should treat as a silent drop
	/// (`SymbolicExecutionFailure` or `ClassifierReject`).
	pub fn classify(&self, gadget: &Gadget) -> Result<Gadget> {
		let regfile = executor::execute(&gadget.bytes, self.arch, gadget.address).map_err(|e| {
			log::debug!("{:#x}: symbolic executor dropped this gadget ({e})", gadget.address);
			e
		})?;
		if regfile.memory_write {
			log::debug!("{:#x}: rejected, writes to memory or a pointer", gadget.address);
			return Err(Error::ClassifierReject("gadget writes to memory or a pointer"));
		}

		let ptr_width = self.arch.pointer_width() as i64;
		let mut regs = BTreeMap::new();
		let mut sp_delta = 0i64;
		let mut ip_delta = 0i64;
		let mut saw_ip = false;
		let mut saw_sp = false;

		for (reg_out, expr) in regfile.outputs() {
			if reg_out.is_flags() {
				continue;
			}
			if reg_out == self.arch.sp_reg() {
				sp_delta = expr.displacement_of().1;
				saw_sp = true;
				continue;
			}
			if reg_out == self.arch.ip_reg() {
				ip_delta = expr.displacement_of().1;
				saw_ip = true;
				continue;
			}

			let effect = match expr {
				SymExpr::Mem { addr, width_bits } => {
					let locations = addr.locations_of();
					let base = match locations.len() {
						1 => MemBase::Single(locations[0]),
						_ => MemBase::Composite(locations),
					};
					RegEffect::Load(MemRef { base, displacement: addr.displacement_of().1, width_bits: *width_bits })
				}
				SymExpr::Reg(r) => RegEffect::RegAlias(*r),
				SymExpr::Const(c) => RegEffect::Const(*c),
				SymExpr::Add(..) | SymExpr::Sub(..) => RegEffect::MultiReg(expr.locations_of()),
			};
			regs.insert(reg_out, effect);
		}

		if !saw_ip || !saw_sp {
			log::debug!("{:#x}: rejected, never reaches a terminating branch", gadget.address);
			return Err(Error::ClassifierReject("gadget never reaches a terminating branch"));
		}
		if sp_delta < 0 {
			log::debug!("{:#x}: rejected, negative sp_delta {sp_delta}", gadget.address);
			return Err(Error::ClassifierReject("negative stack pointer delta"));
		}
		if ip_delta != sp_delta - ptr_width {
			log::debug!(
				"{:#x}: rejected, ip_delta {ip_delta} != sp_delta {sp_delta} - pointer_width {ptr_width}",
				gadget.address
			);
			return Err(Error::ClassifierReject("ip_delta != sp_delta - pointer_width"));
		}

		Ok(Gadget {
			address: gadget.address,
			insns: gadget.insns.clone(),
			bytes: gadget.bytes.clone(),
			regs,
			sp_delta,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::RegName;

	#[test]
	fn pop_rdi_ret() {
		let gadget = Gadget::new(0x400000, vec!["pop rdi".into(), "ret".into()], vec![0x5f, 0xc3]);
		let classified = Classifier::new(Arch::X64).classify(&gadget).expect("classifies");
		assert_eq!(classified.sp_delta, 16);
		match classified.regs.get(&RegName("rdi")) {
			Some(RegEffect::Load(mem)) => {
				assert_eq!(mem.base, MemBase::Single(RegName("rsp")));
				assert_eq!(mem.displacement, 0);
				assert_eq!(mem.width_bits, 64);
			}
			other => panic!("expected a Load effect, got {other:?}"),
		}
	}

	#[test]
	fn bare_ret() {
		let gadget = Gadget::new(0x400100, vec!["ret".into()], vec![0xc3]);
		let classified = Classifier::new(Arch::X64).classify(&gadget).expect("classifies");
		assert_eq!(classified.sp_delta, 8);
		assert!(classified.regs.is_empty());
	}

	#[test]
	fn call_reg_is_neutralized_to_ret_semantics() {
		// `call rax` (FF D0): rewritten to the effect of a `ret`, the call's
		// own destination operand plays no role in the classified gadget at
		// all, and the gadget is accepted rather than rejected for a phantom
		// memory write.
		let bytes = vec![0xff, 0xd0];
		let gadget = Gadget::new(0x400300, vec!["call rax".into()], bytes);
		let classified = Classifier::new(Arch::X64).classify(&gadget).expect("classifies");
		assert_eq!(classified.sp_delta, 8);
		assert!(classified.regs.is_empty());
	}

	#[test]
	fn memory_write_is_rejected() {
		// mov [rdi], rax; ret
		let bytes = vec![0x48, 0x89, 0x07, 0xc3];
		let gadget = Gadget::new(0x400200, vec!["mov [rdi], rax".into(), "ret".into()], bytes);
		assert!(Classifier::new(Arch::X64).classify(&gadget).is_err());
	}

	#[test]
	fn classify_is_idempotent() {
		let gadget = Gadget::new(0x400000, vec!["pop rdi".into(), "ret".into()], vec![0x5f, 0xc3]);
		let classifier = Classifier::new(Arch::X64);
		let once = classifier.classify(&gadget).unwrap();
		let twice = classifier.classify(&once).unwrap();
		assert_eq!(once, twice);
	}

	#[test]
	fn arm_pop_r4_pc() {
		let bytes = vec![0x10, 0x80, 0xBD, 0xE8];
		let gadget = Gadget::new(0x10000, vec!["pop {r4, pc}".into()], bytes);
		let classified = Classifier::new(Arch::Arm).classify(&gadget).expect("classifies");
		assert_eq!(classified.sp_delta, 8);
		match classified.regs.get(&RegName("r4")) {
			Some(RegEffect::Load(mem)) => {
				assert_eq!(mem.base, MemBase::Single(RegName("sp")));
				assert_eq!(mem.displacement, 0);
				assert_eq!(mem.width_bits, 32);
			}
			other => panic!("expected a Load effect, got {other:?}"),
		}
	}

	/// x64 `pop <reg>` x N; `ret`, for N in 0..=3 and an arbitrary choice of
	/// registers (skipping rsp, which `step`'s `Pop` arm would otherwise
	/// happily treat as a gadget that pops into the stack pointer itself,
	/// a real but degenerate case this generator isn't trying to cover).
	const POP_OPCODES: &[(u8, &str)] =
		&[(0x58, "rax"), (0x59, "rcx"), (0x5A, "rdx"), (0x5B, "rbx"), (0x5D, "rbp"), (0x5E, "rsi"), (0x5F, "rdi")];

	fn build_pop_chain(indices: &[usize]) -> Gadget {
		let mut bytes = Vec::new();
		let mut insns = Vec::new();
		for &i in indices {
			let (opcode, name) = POP_OPCODES[i % POP_OPCODES.len()];
			bytes.push(opcode);
			insns.push(format!("pop {name}"));
		}
		bytes.push(0xc3);
		insns.push("ret".to_string());
		Gadget::new(0x400000, insns, bytes)
	}

	use proptest::prelude::*;

	proptest! {
		#[test]
		fn sp_delta_is_nonnegative_multiple_of_pointer_width(indices in proptest::collection::vec(0usize..POP_OPCODES.len(), 0..4)) {
			let gadget = build_pop_chain(&indices);
			let classified = Classifier::new(Arch::X64).classify(&gadget).expect("classifies");
			prop_assert!(classified.sp_delta >= 0);
			prop_assert_eq!(classified.sp_delta % 8, 0);
			prop_assert_eq!(classified.sp_delta, 8 * (indices.len() as i64 + 1));
		}

		#[test]
		fn classify_idempotence_over_pop_chains(indices in proptest::collection::vec(0usize..POP_OPCODES.len(), 0..4)) {
			let gadget = build_pop_chain(&indices);
			let classifier = Classifier::new(Arch::X64);
			let once = classifier.classify(&gadget).expect("classifies");
			let twice = classifier.classify(&once).expect("classifies again");
			prop_assert_eq!(once, twice);
		}

		#[test]
		fn flags_register_never_appears_in_regs(indices in proptest::collection::vec(0usize..POP_OPCODES.len(), 0..4)) {
			let gadget = build_pop_chain(&indices);
			let classified = Classifier::new(Arch::X64).classify(&gadget).expect("classifies");
			prop_assert!(!classified.regs.keys().any(|r| r.is_flags()));
		}
	}
}
