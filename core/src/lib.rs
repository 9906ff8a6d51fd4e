//! Deterministic, budget-constrained context pack pipeline.
//!
//! Signals flow through the planner, are defaulted and sealed by the
//! builder, checked by the validator, and reduced by the assembler into a
//! manifest that fits the pack's budgets. The gate re-checks sealed packs
//! independently of the assembler.
//!
//! Every stage is a pure function over in-memory values: no filesystem,
//! network or clock access happens here.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod assemble;
pub mod builder;
pub mod canonical;
pub mod error;
pub mod gate;
pub mod hash;
pub mod manifest;
pub mod paths;
pub mod planner;
pub mod types;
pub mod validate;

pub use assemble::{AssembleOptions, assemble, assemble_value};
pub use builder::{PackDraft, build_pack};
pub use canonical::{CanonicalError, canonicalize, canonicalize_value};
pub use error::{ErrorCode, PackError, Result, ValidationErrors, Violation};
pub use gate::{GateMode, GateOptions, GateOutcome, gate};
pub use hash::{Sealable, seal, seal_hash, seal_hash_value, verify, verify_value};
pub use manifest::Manifest;
pub use planner::{PlanInputs, PlanOutput, plan_from_signals};
pub use types::{Pack, SectionName};
pub use validate::{ValidateOptions, ValidationReport, validate, validate_pack};

/// Crate version, recorded as the generator in provenance records.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
