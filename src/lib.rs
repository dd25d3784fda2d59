//! ROP gadget discovery, classification and chain solving for x86, x86-64
//! and ARMv7 (ARM mode only, no Thumb interworking).
//!
//! The pipeline is `Finder` (scan + disassemble + filter + dedup) ──►
//! `Classifier` (symbolic classification of a single gadget) ──► `Solver`
//! (SMT-backed verification of a gadget chain against register
//! post-conditions).

pub mod arch;
pub mod cache;
pub mod classifier;
pub mod disasm;
pub mod error;
pub mod executor;
pub mod expr;
pub mod gadget;
pub mod image;
pub mod scanner;
pub mod solver;

pub use arch::{Arch, RegName};
pub use classifier::Classifier;
pub use error::{Error, Result};
pub use gadget::{Gadget, GadgetChain, MemBase, MemRef, RegEffect};
pub use image::LoadedImage;
pub use scanner::{Finder, GadgetFilter, Image, Segment};
pub use solver::{Solver, VerifiedPath};
