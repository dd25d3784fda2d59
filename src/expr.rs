use crate::arch::RegName;
use std::collections::BTreeSet;

/// A symbolic expression over the initial register/memory state of a
/// gadget (or concatenated chain of gadgets).
///
/// This is the internal representation the executor builds and the
/// classifier and solver both consume; it plays the role of a "mapper"
/// query protocol over gadget semantics (`is_const | is_reg |
/// is_memory_load | is_pointer_write`, `displacement_of`, `locations_of`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymExpr {
	Const(u64),
	Reg(RegName),
	/// A load from memory at the given address expression, of the given
	/// width in bits.
	Mem { addr: Box<SymExpr>, width_bits: u16 },
	Add(Box<SymExpr>, Box<SymExpr>),
	Sub(Box<SymExpr>, Box<SymExpr>),
}

impl SymExpr {
	pub fn reg(name: RegName) -> Self { SymExpr::Reg(name) }

	pub fn mem(addr: SymExpr, width_bits: u16) -> Self {
		SymExpr::Mem { addr: Box::new(addr), width_bits }
	}

	pub fn add(self, rhs: SymExpr) -> Self {
		match (&self, &rhs) {
			(SymExpr::Const(a), SymExpr::Const(b)) => SymExpr::Const(a.wrapping_add(*b)),
			_ => SymExpr::Add(Box::new(self), Box::new(rhs)),
		}
	}

	pub fn add_const(self, c: i64) -> Self {
		if c >= 0 {
			self.add(SymExpr::Const(c as u64))
		}
		else {
			self.sub(SymExpr::Const((-c) as u64))
		}
	}

	pub fn sub(self, rhs: SymExpr) -> Self {
		match (&self, &rhs) {
			(SymExpr::Const(a), SymExpr::Const(b)) => SymExpr::Const(a.wrapping_sub(*b)),
			_ => SymExpr::Sub(Box::new(self), Box::new(rhs)),
		}
	}

	pub fn is_const(&self) -> bool { matches!(self, SymExpr::Const(_)) }

	pub fn is_reg(&self) -> bool { matches!(self, SymExpr::Reg(_)) }

	pub fn is_memory_load(&self) -> bool { matches!(self, SymExpr::Mem { .. }) }

	/// A gadget that could *store to* memory or load a value later used as
	/// an address-of-a-store is rejected upstream during execution, before
	/// a `SymExpr` is ever produced for it (this crate's executor only
	/// models register outputs, never memory writes), so from the
	/// classifier's point of view there is no separate "pointer write"
	/// variant to test for; this predicate exists to keep the mapper query
	/// protocol complete, and always returns `false`.
	pub fn is_pointer_write(&self) -> bool { false }

	/// Returns `(base, const_offset)` where `base` is the single register
	/// the expression is anchored on (if any) and `const_offset` is the
	/// accumulated additive constant. Returns `None` only when the
	/// expression contains no registers at all and no constant sums to
	/// extract a displacement from in a meaningful way (never actually
	/// reached for `sp`/`ip`, which are always affine in a single register).
	pub fn displacement_of(&self) -> (Option<RegName>, i64) {
		match self {
			SymExpr::Const(c) => (None, *c as i64),
			SymExpr::Reg(r) => (Some(*r), 0),
			SymExpr::Mem { addr, .. } => addr.displacement_of(),
			SymExpr::Add(a, b) => {
				let (base_a, off_a) = a.displacement_of();
				let (base_b, off_b) = b.displacement_of();
				(base_a.or(base_b), off_a + off_b)
			}
			SymExpr::Sub(a, b) => {
				let (base_a, off_a) = a.displacement_of();
				let (base_b, off_b) = b.displacement_of();
				(base_a.or(base_b), off_a - off_b)
			}
		}
	}

	/// The set of input registers the expression mentions, in a
	/// deterministic (sorted by name) order.
	pub fn locations_of(&self) -> Vec<RegName> {
		let mut set = BTreeSet::new();
		self.collect_regs(&mut set);
		set.into_iter().collect()
	}

	fn collect_regs(&self, out: &mut BTreeSet<RegName>) {
		match self {
			SymExpr::Const(_) => {}
			SymExpr::Reg(r) => {
				out.insert(*r);
			}
			SymExpr::Mem { addr, .. } => addr.collect_regs(out),
			SymExpr::Add(a, b) | SymExpr::Sub(a, b) => {
				a.collect_regs(out);
				b.collect_regs(out);
			}
		}
	}

}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::Arch;

	#[test]
	fn displacement_of_pop_then_ret() {
		let arch = Arch::X64;
		let sp = SymExpr::reg(arch.sp_reg());
		let after_two_pops = sp.add_const(16);
		assert_eq!(after_two_pops.displacement_of(), (Some(arch.sp_reg()), 16));
	}

	#[test]
	fn locations_of_collects_all_regs() {
		let a = SymExpr::reg(RegName("rax"));
		let b = SymExpr::reg(RegName("rbx"));
		let combined = a.add(b);
		assert_eq!(combined.locations_of(), vec![RegName("rax"), RegName("rbx")]);
	}

	#[test]
	fn const_folding_on_add_and_sub() {
		let e = SymExpr::Const(4).add(SymExpr::Const(6));
		assert_eq!(e, SymExpr::Const(10));
		let e = SymExpr::Const(10).sub(SymExpr::Const(3));
		assert_eq!(e, SymExpr::Const(7));
	}
}
