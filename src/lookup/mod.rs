//! Identifier resolution at the engine boundary: step reference parsing
//! and entity lookup over jobs, artifacts, and sessions.

pub mod entity_lookup;
pub mod step_parser;

pub use entity_lookup::{EntityLookup, LookupResult};
pub use step_parser::{StepReference, is_step_reference, parse_step_reference};
