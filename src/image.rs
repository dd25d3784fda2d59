//! The image adapter. Loads an ELF file from disk and produces the
//! `scanner::Image` view the rest of the crate scans, caches and classifies
//! against. PE/Mach-O are out of scope.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::scanner::{Image, Segment};
use goblin::elf::header::{EM_386, EM_ARM, EM_X86_64, ET_DYN};
use goblin::elf64::program_header::{PF_X, PT_LOAD};
use goblin::Object;
use std::fs;
use std::path::{Path, PathBuf};

struct Executable {
	vaddr: u64,
	start_offset: usize,
	end_offset: usize,
}

/// An ELF image read from disk, owning its raw bytes and holding just
/// enough of its program header table to hand the Scanner a set of
/// executable segments.
pub struct LoadedImage {
	path: PathBuf,
	bytes: Vec<u8>,
	arch: Arch,
	load_addr: u64,
	is_dyn: bool,
	executable_segments: Vec<Executable>,
}

impl LoadedImage {
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref().to_path_buf();
		let bytes = fs::read(&path)?;
		Self::from_bytes(path, bytes)
	}

	fn from_bytes(path: PathBuf, bytes: Vec<u8>) -> Result<Self> {
		let elf = match Object::parse(&bytes)? {
			Object::Elf(elf) => elf,
			_ => return Err(Error::ImageLoadFailure(format!("{} is not an ELF image", path.display()))),
		};

		let arch = match elf.header.e_machine {
			EM_386 => Arch::X86,
			EM_X86_64 => Arch::X64,
			EM_ARM => Arch::Arm,
			other => return Err(Error::UnsupportedArchitecture(format!("e_machine {other}"))),
		};

		let is_dyn = elf.header.e_type == ET_DYN;
		let load_addr =
			elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD).map(|h| h.p_vaddr).min().unwrap_or(0);

		let executable_segments = elf
			.program_headers
			.iter()
			.filter(|h| h.p_type == PT_LOAD && h.p_flags & PF_X != 0)
			.map(|h| Executable {
				vaddr: h.p_vaddr,
				start_offset: h.p_offset as usize,
				end_offset: (h.p_offset + h.p_filesz) as usize,
			})
			.collect();

		Ok(LoadedImage { path, bytes, arch, load_addr, is_dyn, executable_segments })
	}

	pub fn path(&self) -> &Path { &self.path }

	pub fn arch(&self) -> Arch { self.arch }

	/// Builds the `scanner::Image` view of this file. `runtime_address` is
	/// the image's currently mapped base, when known to differ from its
	/// static `load_addr` (e.g. a loader that reports the post-ASLR base);
	/// pass `None` to scan as if loaded at its own static address.
	pub fn as_scanner_image(&self, runtime_address: Option<u64>) -> Image<'_> {
		let segments = self
			.executable_segments
			.iter()
			.map(|e| Segment { vaddr: e.vaddr, data: &self.bytes[e.start_offset..e.end_offset] })
			.collect();
		Image {
			arch: self.arch,
			segments,
			load_addr: self.load_addr,
			address: runtime_address.unwrap_or(self.load_addr),
			is_dyn: self.is_dyn,
			raw_bytes: &self.bytes,
			name: self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// A minimal, hand-built 64-bit ELF header plus one PT_LOAD/executable
	// program header wrapping a `pop rdi; ret` payload, enough to exercise
	// `from_bytes` without a real linked binary on disk.
	fn tiny_elf(e_machine: u16, payload: &[u8]) -> Vec<u8> {
		let ehsize = 64usize;
		let phentsize = 56usize;
		let phoff = ehsize;
		let text_offset = phoff + phentsize;
		let mut bytes = vec![0u8; text_offset + payload.len()];
		bytes[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
		bytes[4] = 2; // ELFCLASS64
		bytes[5] = 1; // little endian
		bytes[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
		bytes[18..20].copy_from_slice(&e_machine.to_le_bytes());
		bytes[24..32].copy_from_slice(&0u64.to_le_bytes()); // e_entry
		bytes[32..40].copy_from_slice(&(phoff as u64).to_le_bytes()); // e_phoff
		bytes[52..54].copy_from_slice(&(ehsize as u16).to_le_bytes());
		bytes[54..56].copy_from_slice(&(phentsize as u16).to_le_bytes());
		bytes[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

		let ph = &mut bytes[phoff..phoff + phentsize];
		ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
		ph[4..8].copy_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
		ph[8..16].copy_from_slice(&(text_offset as u64).to_le_bytes()); // p_offset
		ph[16..24].copy_from_slice(&0x400000u64.to_le_bytes()); // p_vaddr
		ph[32..40].copy_from_slice(&(payload.len() as u64).to_le_bytes()); // p_filesz
		ph[40..48].copy_from_slice(&(payload.len() as u64).to_le_bytes()); // p_memsz

		bytes[text_offset..].copy_from_slice(payload);
		bytes
	}

	#[test]
	fn loads_x64_executable_segment() {
		let bytes = tiny_elf(EM_X86_64, &[0x5f, 0xc3]);
		let image = LoadedImage::from_bytes(PathBuf::from("test.elf"), bytes).expect("parses");
		assert_eq!(image.arch(), Arch::X64);
		let view = image.as_scanner_image(None);
		assert_eq!(view.segments.len(), 1);
		assert_eq!(view.segments[0].vaddr, 0x400000);
		assert_eq!(view.segments[0].data, &[0x5f, 0xc3]);
	}

	#[test]
	fn unsupported_machine_is_rejected() {
		let bytes = tiny_elf(0xbeef, &[0xc3]);
		assert!(LoadedImage::from_bytes(PathBuf::from("test.elf"), bytes).is_err());
	}
}
