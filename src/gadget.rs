use crate::arch::RegName;
use std::collections::BTreeMap;
use std::fmt;

/// The set of input registers an address expression depends on, joined
/// with `_` for display when more than one register is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemBase {
	Single(RegName),
	Composite(Vec<RegName>),
}

impl fmt::Display for MemBase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MemBase::Single(r) => write!(f, "{r}"),
			MemBase::Composite(regs) => {
				let joined: Vec<String> = regs.iter().map(|r| r.to_string()).collect();
				write!(f, "{}", joined.join("_"))
			}
		}
	}
}

/// A symbolic memory location: `base` displaced by `displacement`, of
/// `width_bits` bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRef {
	pub base: MemBase,
	pub displacement: i64,
	pub width_bits: u16,
}

/// What a classified gadget writes to one output register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegEffect {
	Const(u64),
	RegAlias(RegName),
	Load(MemRef),
	MultiReg(Vec<RegName>),
}

/// A candidate or classified gadget.
///
/// `regs` and `sp_delta` are empty/zero until the `Classifier` has run;
/// the struct shape is otherwise identical before and after classification:
/// a gadget is created by the Scanner, refined in place by the Classifier,
/// and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gadget {
	pub address: u64,
	pub insns: Vec<String>,
	pub bytes: Vec<u8>,
	pub regs: BTreeMap<RegName, RegEffect>,
	pub sp_delta: i64,
}

impl Gadget {
	pub fn new(address: u64, insns: Vec<String>, bytes: Vec<u8>) -> Self {
		Gadget { address, insns, bytes, regs: BTreeMap::new(), sp_delta: 0 }
	}

	/// The deduplication key: the joined mnemonic string.
	pub fn dedup_key(&self) -> String { self.insns.join("; ") }
}

/// An ordered chain of (classified) gadgets whose bytes are conceptually
/// concatenated for symbolic execution by the Solver.
pub type GadgetChain = Vec<Gadget>;
