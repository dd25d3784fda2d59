//! The on-disk gadget cache.
//!
//! One file per image, named by the lowercase hex SHA-256 of the image's
//! raw bytes, under `<tmpdir>/binjitsu-rop-cache/`. The payload is a
//! `{address -> bytes}` map serialized as strictly-parsed JSON. Writes go
//! through a temp file in the same directory followed by an atomic
//! rename, so concurrent writers never observe a partially written cache
//! file.

use crate::error::{Error, Result};
use crate::gadget::Gadget;
use crate::scanner::Image;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

fn cache_dir() -> PathBuf { std::env::temp_dir().join("binjitsu-rop-cache") }

fn cache_path(image: &Image) -> PathBuf {
	let mut hasher = Sha256::new();
	hasher.update(image.raw_bytes);
	let digest = hasher.finalize();
	cache_dir().join(format!("{digest:x}"))
}

/// Addresses are stored relative to the image's static load address so the
/// cache survives being reloaded at a different ASLR base.
fn to_stored_address(image: &Image, runtime_addr: u64) -> u64 {
	runtime_addr.wrapping_add(image.load_addr).wrapping_sub(image.address)
}

fn to_runtime_address(image: &Image, stored_addr: u64) -> u64 {
	stored_addr.wrapping_sub(image.load_addr).wrapping_add(image.address)
}

/// Loads and redisassembles a cached catalog for `image`, or `Ok(None)` on
/// a cache miss (file absent, or corrupted; corruption is never fatal,
/// per the crate's `CacheCorrupted` policy: the caller just rescans).
pub fn load(image: &Image) -> Result<Option<Vec<Gadget>>> {
	let path = cache_path(image);
	let bytes = match fs::read(&path) {
		Ok(b) => b,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(Error::Io(e)),
	};

	let stored: BTreeMap<u64, Vec<u8>> = match serde_json::from_slice(&bytes) {
		Ok(m) => m,
		Err(e) => {
			log::warn!("cache file {} was corrupted ({e}), treating as a miss", path.display());
			return Ok(None);
		}
	};

	let mut out = Vec::with_capacity(stored.len());
	for (stored_addr, gadget_bytes) in stored {
		let runtime_addr = to_runtime_address(image, stored_addr);
		let insns = match crate::disasm::decode_window(&gadget_bytes, runtime_addr, image.arch) {
			Some(insns) => insns.into_iter().map(|i| i.text).collect(),
			None => {
				log::debug!("cached gadget at {runtime_addr:#x} no longer disassembles, dropping");
				continue;
			}
		};
		out.push(Gadget::new(runtime_addr, insns, gadget_bytes));
	}
	Ok(Some(out))
}

/// Atomically overwrites the cache file for `image` with `gadgets`.
pub fn save(image: &Image, gadgets: &[Gadget]) -> Result<()> {
	let map: BTreeMap<u64, Vec<u8>> =
		gadgets.iter().map(|g| (to_stored_address(image, g.address), g.bytes.clone())).collect();

	let dir = cache_dir();
	fs::create_dir_all(&dir)?;
	let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
	serde_json::to_writer(&mut tmp, &map)?;
	tmp.persist(cache_path(image)).map_err(|e| Error::Io(e.error))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::Arch;
	use crate::scanner::Segment;

	// A marker unlikely to collide with any other cache entry this crate's
	// tests (or a real scan) would ever produce.
	const MARKER: &[u8] = b"gadgetry-cache-roundtrip-test-marker-\x5f\xc3";

	fn image<'a>(data: &'a [u8], load_addr: u64, address: u64) -> Image<'a> {
		Image {
			arch: Arch::X64,
			segments: vec![Segment { vaddr: load_addr, data }],
			load_addr,
			address,
			is_dyn: false,
			raw_bytes: MARKER,
			name: "cache-test".to_string(),
		}
	}

	#[test]
	fn round_trip_preserves_catalog() {
		let data = [0x5f, 0xc3];
		let img = image(&data, 0x400000, 0x400000);
		let gadgets = vec![Gadget::new(0x400000, vec!["pop rdi".into(), "ret".into()], data.to_vec())];

		save(&img, &gadgets).expect("save");
		let loaded = load(&img).expect("load").expect("cache hit");
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].address, 0x400000);
		assert_eq!(loaded[0].insns, vec!["pop rdi", "ret"]);
		assert_eq!(loaded[0].bytes, data);
	}

	#[test]
	fn addresses_rebase_across_aslr_placements() {
		let data = [0x5f, 0xc3];
		let at_static_base = image(&data, 0x400000, 0x400000);
		let gadgets = vec![Gadget::new(0x400000, vec!["pop rdi".into(), "ret".into()], data.to_vec())];
		save(&at_static_base, &gadgets).expect("save");

		// Same image (same raw bytes => same cache file), but reported as
		// mapped at a different runtime base, as a loader under ASLR would.
		let relocated = image(&data, 0x400000, 0x500000);
		let loaded = load(&relocated).expect("load").expect("cache hit");
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].address, 0x500000);
	}

	#[test]
	fn missing_file_is_a_clean_miss() {
		let data = b"gadgetry-cache-roundtrip-test-marker-never-saved";
		let img = Image {
			arch: Arch::X64,
			segments: vec![],
			load_addr: 0,
			address: 0,
			is_dyn: false,
			raw_bytes: data,
			name: "missing".to_string(),
		};
		assert!(load(&img).expect("no io error").is_none());
	}
}
