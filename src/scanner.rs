//! The gadget scanner, dedup pass and big-binary instruction allow-list.

use crate::arch::Arch;
use crate::disasm::{decode_window, pass_clean};
use crate::error::Result;
use crate::gadget::Gadget;
use rayon::prelude::*;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use rustc_hash::FxHashSet;

/// The filter classes: `all | ret | jmp | call | int | sysenter | syscall`
/// for x86/x64, `all | ret | svc` for ARM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GadgetFilter {
	All,
	Ret,
	Jmp,
	Call,
	Int,
	Sysenter,
	Syscall,
	Svc,
}

/// One executable segment of a loaded image, as supplied by the (external)
/// loader: a virtual base and the raw bytes mapped there.
pub struct Segment<'a> {
	pub vaddr: u64,
	pub data: &'a [u8],
}

/// The subset of a loaded image's fields the Scanner and cache need.
pub struct Image<'a> {
	pub arch: Arch,
	pub segments: Vec<Segment<'a>>,
	/// Static base address from the image's own metadata.
	pub load_addr: u64,
	/// Currently mapped base (equal to `load_addr` unless the caller knows
	/// the image was relocated, e.g. by ASLR).
	pub address: u64,
	/// `true` for `ET_DYN` (position-independent) images.
	pub is_dyn: bool,
	/// Raw image bytes, used both for the big-binary heuristic and for
	/// cache naming.
	pub raw_bytes: &'a [u8],
	pub name: String,
}

struct Pattern {
	regex: BytesRegex,
	size: usize,
	align: usize,
	filter: GadgetFilter,
}

fn pattern_table(arch: Arch) -> Vec<Pattern> {
	let mk = |pat: &str, size: usize, align: usize, filter: GadgetFilter| Pattern {
		regex: BytesRegex::new(&format!("(?s-u){pat}")).expect("static pattern is valid"),
		size,
		align,
		filter,
	};
	match arch {
		Arch::X86 | Arch::X64 => vec![
			mk(r"\xc3", 1, 1, GadgetFilter::Ret),
			mk(r"\xc2..", 3, 1, GadgetFilter::Ret),
			mk(r"\xff[\x20-\x23\x26\x27]", 2, 1, GadgetFilter::Jmp),
			mk(r"\xff[\xe0-\xe4\xe6\xe7]", 2, 1, GadgetFilter::Jmp),
			mk(r"\xff[\x10-\x13\x16\x17]", 2, 1, GadgetFilter::Call),
			mk(r"\xff[\xd0-\xd4\xd6\xd7]", 2, 1, GadgetFilter::Call),
			mk(r"\xcd\x80", 2, 1, GadgetFilter::Int),
			mk(r"\x0f\x34", 2, 1, GadgetFilter::Sysenter),
			mk(r"\x0f\x05", 2, 1, GadgetFilter::Syscall),
		],
		Arch::Arm => vec![
			mk(r".\x80\xbd\xe8", 4, 4, GadgetFilter::Ret),
			mk(r"...\xef", 4, 4, GadgetFilter::Svc),
		],
	}
}

fn filter_matches(filter: GadgetFilter, wanted: GadgetFilter) -> bool {
	wanted == GadgetFilter::All || wanted == filter
}

/// The big-binary allow-list, used only when the image is x86/x64 and at
/// least 100 KiB of raw bytes (the originating source left this threshold
/// as an ambiguous `100 * 1000`; resolved here to 100 KiB, `100 * 1024`).
fn big_binary_allowlist() -> Vec<Regex> {
	[
		r"^pop (.{3})",
		r"^add .sp, (\S+)$",
		r"^ret$",
		r"^leave$",
		r"^mov (.{3}), (.{3})",
		r"^xchg (.{3}), (.{3})",
		r"int +0x80",
		r"^syscall$",
		r"^sysenter$",
	]
	.iter()
	.map(|p| Regex::new(p).expect("static pattern is valid"))
	.collect()
}

const BIG_BINARY_THRESHOLD: usize = 100 * 1024;

pub struct Finder<'a> {
	images: Vec<Image<'a>>,
	filter: GadgetFilter,
	depth: usize,
}

impl<'a> Finder<'a> {
	pub fn new(images: Vec<Image<'a>>, filter: GadgetFilter, depth: usize) -> Self {
		Finder { images, filter, depth }
	}

	pub fn load_gadgets(&self) -> Result<Vec<Gadget>> {
		let mut out = Vec::new();
		for image in &self.images {
			if let Some(cached) = crate::cache::load(image)? {
				log::info!("{}: {} gadgets loaded from cache", image.name, cached.len());
				out.extend(cached);
				continue;
			}
			let gadgets = self.scan_image(image);
			log::info!("{}: {} gadgets found", image.name, gadgets.len());
			crate::cache::save(image, &gadgets)?;
			out.extend(gadgets);
		}
		Ok(out)
	}

	fn scan_image(&self, image: &Image) -> Vec<Gadget> {
		let patterns = pattern_table(image.arch);
		let big_binary =
			matches!(image.arch, Arch::X86 | Arch::X64) && image.raw_bytes.len() >= BIG_BINARY_THRESHOLD;
		if big_binary {
			log::debug!(
				"{}: {} bytes, applying the big-binary instruction allow-list",
				image.name,
				image.raw_bytes.len()
			);
		}
		let allowlist = if big_binary { Some(big_binary_allowlist()) } else { None };

		let mut ordered: Vec<((usize, usize, usize), Gadget)> = Vec::new();
		for (pattern_idx, pattern) in patterns.iter().enumerate() {
			if !filter_matches(pattern.filter, self.filter) {
				continue;
			}
			for segment in &image.segments {
				let matches: Vec<usize> =
					pattern.regex.find_iter(segment.data).map(|m| m.start()).collect();
				let found: Vec<((usize, usize, usize), Gadget)> = matches
					.into_par_iter()
					.flat_map_iter(|offset| {
						self.candidates_at(image, segment, pattern, pattern_idx, offset, &allowlist)
					})
					.collect();
				ordered.extend(found);
			}
		}
		ordered.sort_by(|(a, _), (b, _)| a.cmp(b));
		dedup(ordered.into_iter().map(|(_, g)| g))
	}

	fn candidates_at<'p>(
		&self,
		image: &Image,
		segment: &Segment,
		pattern: &Pattern,
		pattern_idx: usize,
		offset: usize,
		allowlist: &Option<Vec<Regex>>,
	) -> Vec<((usize, usize, usize), Gadget)> {
		let mut out = Vec::new();
		for i in 0..self.depth {
			let back = i * pattern.align;
			if back > offset {
				break;
			}
			let window_start = offset - back;
			let window_end = offset + pattern.size;
			if window_end > segment.data.len() {
				continue;
			}
			let mut vaddr = segment.vaddr.wrapping_add(window_start as u64);
			if image.is_dyn {
				vaddr = vaddr.wrapping_add(image.address);
			}
			if vaddr % pattern.align as u64 != 0 {
				continue;
			}
			let window = &segment.data[window_start..window_end];
			let Some(insns) = decode_window(window, vaddr, image.arch)
			else {
				log::trace!("{vaddr:#x}: window failed to decode, dropped");
				continue;
			};
			if !pass_clean(&insns) {
				log::trace!("{vaddr:#x}: rejected by pass_clean, dropped");
				continue;
			}
			let insn_texts: Vec<String> = insns.iter().map(|i| i.text.clone()).collect();
			if let Some(allowlist) = allowlist {
				if !insn_texts.iter().all(|text| allowlist.iter().any(|re| re.is_match(text))) {
					log::trace!("{vaddr:#x}: rejected by the big-binary allow-list, dropped");
					continue;
				}
			}
			let gadget = Gadget::new(vaddr, insn_texts, window.to_vec());
			out.push(((pattern_idx, offset, i), gadget));
		}
		out
	}
}

/// First-seen-wins dedup over the joined mnemonic string, preserving the
/// order of `gadgets`.
fn dedup(gadgets: impl Iterator<Item = Gadget>) -> Vec<Gadget> {
	let mut seen = FxHashSet::default();
	let mut out = Vec::new();
	for gadget in gadgets {
		let key = gadget.dedup_key();
		if seen.insert(key) {
			out.push(gadget);
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn finds_pop_rdi_ret() {
		let bytes = [0x5f, 0xc3];
		let image = Image {
			arch: Arch::X64,
			segments: vec![Segment { vaddr: 0x400000, data: &bytes }],
			load_addr: 0x400000,
			address: 0x400000,
			is_dyn: false,
			raw_bytes: &bytes,
			name: "test".to_string(),
		};
		let finder = Finder::new(vec![image], GadgetFilter::All, 10);
		let gadgets = finder.scan_image(&finder.images[0]);
		assert!(gadgets.iter().any(|g| g.insns == vec!["pop rdi", "ret"]));
	}

	#[test]
	fn double_ret_window_yields_single_ret_gadget_not_two_rets() {
		let bytes = [0x5f, 0xc3, 0xc3];
		let image = Image {
			arch: Arch::X64,
			segments: vec![Segment { vaddr: 0x400000, data: &bytes }],
			load_addr: 0x400000,
			address: 0x400000,
			is_dyn: false,
			raw_bytes: &bytes,
			name: "test".to_string(),
		};
		let finder = Finder::new(vec![image], GadgetFilter::All, 10);
		let gadgets = finder.scan_image(&finder.images[0]);
		assert!(gadgets.iter().all(|g| g.insns.iter().filter(|i| i.as_str() == "ret").count() <= 1));
	}

	use proptest::prelude::*;

	proptest! {
		/// For any candidate set, `dedup` leaves no two gadgets sharing a
		/// joined-mnemonic string, and keeps exactly one gadget per distinct
		/// key.
		#[test]
		fn dedup_has_no_duplicate_keys(
			keys in proptest::collection::vec(0usize..6, 0..40),
		) {
			let mnemonics = ["pop rdi; ret", "pop rsi; ret", "ret", "pop rbx; ret", "mov eax, ebx; ret", "leave; ret"];
			let gadgets = keys.iter().enumerate().map(|(i, &k)| {
				let insns: Vec<String> = mnemonics[k].split("; ").map(|s| s.to_string()).collect();
				Gadget::new(0x1000 + i as u64, insns, vec![0x90])
			});
			let deduped = dedup(gadgets);

			let unique_keys: std::collections::HashSet<_> = keys.iter().collect();
			prop_assert_eq!(deduped.len(), unique_keys.len());

			let mut seen = std::collections::HashSet::new();
			for g in &deduped {
				prop_assert!(seen.insert(g.dedup_key()));
			}
		}
	}
}
