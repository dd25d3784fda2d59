use thiserror::Error;

/// Every failure mode the crate can surface.
///
/// Per the crate's error policy: `UnsupportedArchitecture`, `ImageLoadFailure`,
/// `Io`, `Elf` and `Json` are fatal and propagate to the caller. The
/// remaining variants (`SymbolicExecutionFailure`, `ClassifierReject`,
/// `SolverUnsat`, `SolverTimeout`, `CacheCorrupted`) are produced internally
/// and handled by dropping the offending gadget / returning `None`; callers
/// driving bulk scans should never need to match on them directly.
#[derive(Debug, Error)]
pub enum Error {
	#[error("unsupported architecture: {0}")]
	UnsupportedArchitecture(String),

	#[error("failed to load image: {0}")]
	ImageLoadFailure(String),

	#[error("symbolic executor could not produce a mapper for this gadget")]
	SymbolicExecutionFailure,

	#[error("gadget rejected by classifier: {0}")]
	ClassifierReject(&'static str),

	#[error("no satisfying assignment exists for this chain")]
	SolverUnsat,

	#[error("solver exceeded its timeout")]
	SolverTimeout,

	#[error("cache file was corrupted: {0}")]
	CacheCorrupted(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Elf(#[from] goblin::error::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
