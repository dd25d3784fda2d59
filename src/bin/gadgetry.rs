use clap::Parser;
use colored::Colorize;
use gadgetry::{Arch, Classifier, Finder, GadgetFilter, LoadedImage};
use std::path::PathBuf;

/// Scan an ELF binary for ROP gadgets.
#[derive(Parser)]
#[command(author, version, about)]
struct Opt {
	/// Path to the ELF binary to scan.
	binary: PathBuf,

	/// Gadget filter: all, ret, jmp, call, int, sysenter, syscall, svc.
	#[arg(short, long, default_value = "all")]
	filter: String,

	/// How far back from a terminator byte to search for a gadget head.
	#[arg(short, long, default_value_t = 10)]
	depth: usize,

	/// Also print each gadget's classified register effects.
	#[arg(short, long)]
	classify: bool,
}

fn parse_filter(s: &str) -> GadgetFilter {
	match s {
		"ret" => GadgetFilter::Ret,
		"jmp" => GadgetFilter::Jmp,
		"call" => GadgetFilter::Call,
		"int" => GadgetFilter::Int,
		"sysenter" => GadgetFilter::Sysenter,
		"syscall" => GadgetFilter::Syscall,
		"svc" => GadgetFilter::Svc,
		_ => GadgetFilter::All,
	}
}

fn print_classification(classifier: &Classifier, gadget: &gadgetry::Gadget) {
	match classifier.classify(gadget) {
		Ok(classified) => {
			println!("    sp_delta = {}", classified.sp_delta);
			for (reg, effect) in &classified.regs {
				println!("    {} = {:?}", reg.to_string().yellow(), effect);
			}
		}
		Err(e) => println!("    {}", format!("rejected: {e}").red()),
	}
}

fn main() -> gadgetry::Result<()> {
	env_logger::init();
	let opt = Opt::parse();

	let image = LoadedImage::open(&opt.binary)?;
	let arch: Arch = image.arch();
	let view = image.as_scanner_image(None);
	let filter = parse_filter(&opt.filter);

	let finder = Finder::new(vec![view], filter, opt.depth);
	let gadgets = finder.load_gadgets()?;

	let classifier = Classifier::new(arch);
	for gadget in &gadgets {
		println!("{}: {}", format!("{:#x}", gadget.address).green(), gadget.insns.join(" ; "));
		if opt.classify {
			print_classification(&classifier, gadget);
		}
	}
	println!("{} gadgets found", gadgets.len().to_string().cyan());
	Ok(())
}
