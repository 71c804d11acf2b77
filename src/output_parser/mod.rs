//! Shared text/JSON extraction helpers used by the streaming LLM client.
//!
//! Carried over from this crate's prior incarnation as a generic LLM-output
//! parsing toolkit; only the two pieces `backend::ollama`'s streaming path
//! depends on survive here — think-tag stripping and code-fence extraction
//! ([`extract`]), and truncated-JSON auto-completion ([`streaming`]).

pub mod extract;
pub mod streaming;

pub use extract::{preprocess, strip_think_tags};
