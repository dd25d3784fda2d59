//! The chain solver. Concatenates a gadget chain, symbolically executes it
//! with the same adapter the classifier uses, and asks an SMT solver for
//! concrete stack bytes that satisfy the caller's register conditions.

use crate::arch::{Arch, RegName};
use crate::error::{Error, Result};
use crate::executor;
use crate::expr::SymExpr;
use crate::gadget::GadgetChain;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Duration;
use z3::ast::{Array, Ast, Bool, Dynamic, BV};
use z3::{Config, Context, Params, SatResult, Sort};

/// `(sp_delta, stack_image)`, or nothing if the chain's conditions are
/// unsatisfiable or need nothing stack-backed.
pub type VerifiedPath = (i64, BTreeMap<i64, u8>);

struct SmtBuilder<'ctx> {
	ctx: &'ctx Context,
	ptr_width: u32,
	sp_reg: RegName,
	stack: Array<'ctx>,
	regs: RefCell<BTreeMap<RegName, BV<'ctx>>>,
	/// `(offset relative to the chain's initial stack pointer, byte term)`
	/// pairs recorded for every byte read from a stack-pointer-relative
	/// address while lowering an expression. Only entries whose address
	/// is anchored on `sp_reg` are recorded.
	stack_reads: RefCell<Vec<(i64, BV<'ctx>)>>,
}

impl<'ctx> SmtBuilder<'ctx> {
	fn new(ctx: &'ctx Context, ptr_width: u32, sp_reg: RegName) -> Self {
		let stack = Array::new_const(ctx, "stack", &Sort::bitvector(ctx, ptr_width), &Sort::bitvector(ctx, 8));
		SmtBuilder {
			ctx,
			ptr_width,
			sp_reg,
			stack,
			regs: RefCell::new(BTreeMap::new()),
			stack_reads: RefCell::new(Vec::new()),
		}
	}

	fn reg_symbol(&self, r: RegName) -> BV<'ctx> {
		if let Some(bv) = self.regs.borrow().get(&r) {
			return bv.clone();
		}
		let bv = BV::new_const(self.ctx, format!("{r}_in"), self.ptr_width);
		self.regs.borrow_mut().insert(r, bv.clone());
		bv
	}

	fn eval(&self, expr: &SymExpr) -> BV<'ctx> {
		match expr {
			SymExpr::Const(c) => BV::from_u64(self.ctx, *c, self.ptr_width),
			SymExpr::Reg(r) => self.reg_symbol(*r),
			SymExpr::Add(a, b) => self.eval(a).bvadd(&self.eval(b)),
			SymExpr::Sub(a, b) => self.eval(a).bvsub(&self.eval(b)),
			SymExpr::Mem { addr, width_bits } => self.eval_mem(addr, *width_bits),
		}
	}

	fn eval_mem(&self, addr: &SymExpr, width_bits: u16) -> BV<'ctx> {
		let addr_bv = self.eval(addr);
		let (base, const_offset) = addr.displacement_of();
		let sp_anchored = base == Some(self.sp_reg);

		let n_bytes = (width_bits / 8).max(1) as u64;
		let mut bytes = Vec::with_capacity(n_bytes as usize);
		for i in 0..n_bytes {
			let idx = addr_bv.bvadd(&BV::from_u64(self.ctx, i, self.ptr_width));
			let selected: Dynamic = self.stack.select(&idx);
			let byte = selected.as_bv().expect("stack array is byte-valued");
			if sp_anchored {
				self.stack_reads.borrow_mut().push((const_offset + i as i64, byte.clone()));
			}
			bytes.push(byte);
		}
		// Little-endian: byte 0 is least significant.
		let mut result = bytes[bytes.len() - 1].clone();
		for byte in bytes[..bytes.len() - 1].iter().rev() {
			result = result.concat(byte);
		}
		result
	}
}

pub struct Solver {
	arch: Arch,
}

impl Solver {
	pub fn new(arch: Arch) -> Self { Solver { arch } }

	/// `conditions` maps a register name to the value the chain must leave
	/// it holding; returns `None` if any condition is unsatisfiable, the
	/// solver times out, or no stack-backed bytes were needed to satisfy
	/// the conditions that were given.
	pub fn verify_path(
		&self,
		chain: &GadgetChain,
		conditions: &BTreeMap<RegName, u64>,
		timeout: Option<Duration>,
	) -> Result<Option<VerifiedPath>> {
		if chain.is_empty() || conditions.is_empty() {
			return Ok(None);
		}

		let bytes: Vec<u8> = chain.iter().flat_map(|g| g.bytes.iter().copied()).collect();
		let base_addr = chain[0].address;
		let regfile = executor::execute(&bytes, self.arch, base_addr)?;

		let sp_expr = regfile.read(self.arch.sp_reg());
		let sp_delta = sp_expr.displacement_of().1;

		let mut cfg = Config::new();
		if let Some(t) = timeout {
			cfg.set_timeout_msec(t.as_millis() as u64);
		}
		let ctx = Context::new(&cfg);
		let solver = z3::Solver::new(&ctx);
		if let Some(t) = timeout {
			let mut params = Params::new(&ctx);
			params.set_u32("timeout", t.as_millis() as u32);
			solver.set_params(&params);
		}

		let ptr_width_bits = self.arch.pointer_width() as u32 * 8;
		let builder = SmtBuilder::new(&ctx, ptr_width_bits, self.arch.sp_reg());

		for (reg, target) in conditions {
			let expr = regfile.read(*reg);
			let lhs = builder.eval(&expr);
			let rhs = BV::from_u64(&ctx, *target, lhs.get_size());
			let eq: Bool = lhs._eq(&rhs);
			solver.assert(&eq);
		}

		match solver.check() {
			// Both an unsatisfiable result and a solver timeout surface to
			// the caller as `None`, neither is an error the caller needs
			// to handle specially.
			SatResult::Unsat | SatResult::Unknown => Ok(None),
			SatResult::Sat => {
				let model = solver.get_model().ok_or(Error::SolverUnsat)?;
				let mut stack_image = BTreeMap::new();
				for (offset, byte_term) in builder.stack_reads.borrow().iter() {
					if let Some(value) = model.eval(byte_term, true).and_then(|bv| bv.as_u64()) {
						stack_image.insert(*offset, value as u8);
					}
				}
				if stack_image.is_empty() {
					return Ok(None);
				}
				Ok(Some((sp_delta, stack_image)))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gadget::Gadget;

	#[test]
	fn pop_ebx_then_mov_eax_ebx() {
		// x86: `pop ebx; ret` then `mov eax, ebx; ret`, solved for eax == 0xbeefdead.
		let pop_ebx_ret = Gadget::new(0x1000, vec!["pop ebx".into(), "ret".into()], vec![0x5b, 0xc3]);
		let mov_eax_ebx_ret =
			Gadget::new(0x2000, vec!["mov eax, ebx".into(), "ret".into()], vec![0x89, 0xd8, 0xc3]);
		let chain = vec![pop_ebx_ret, mov_eax_ebx_ret];

		let mut conditions = BTreeMap::new();
		conditions.insert(RegName("eax"), 0xbeefdeadu64);

		let solver = Solver::new(Arch::X86);
		let (sp_delta, stack_image) = solver.verify_path(&chain, &conditions, None).unwrap().unwrap();
		assert_eq!(sp_delta, 12);
		let expected: BTreeMap<i64, u8> = [(0, 0xAD), (1, 0xDE), (2, 0xEF), (3, 0xBE)].into_iter().collect();
		assert_eq!(stack_image, expected);
	}

	#[test]
	fn condition_without_stack_backing_yields_none() {
		let ret = Gadget::new(0x3000, vec!["ret".into()], vec![0xc3]);
		let mut conditions = BTreeMap::new();
		// `ret` alone never touches eax, so eax's value is the fresh input
		// symbol `eax_in`; asserting `eax_in == 0x41414141` is satisfiable
		// (the solver just picks that value for the input symbol), but no
		// byte of it is ever read from the stack array, so step 5's "no
		// entries were collected" rule applies and the result is `None`.
		conditions.insert(RegName("eax"), 0x41414141u64);
		let solver = Solver::new(Arch::X86);
		assert!(solver.verify_path(&chain_of(ret), &conditions, None).unwrap().is_none());
	}

	fn chain_of(g: Gadget) -> GadgetChain { vec![g] }
}
