//! strdec-core
//!
//! Discovery and decoding of obfuscated strings in compiled binaries.
//!
//! A family-specific rule locates the decode routine (or the code that
//! builds a string inline), a [`tracer::StringTracer`] works out where each
//! encoded string lives and how long it is, a decode function turns the
//! encoded bytes into plaintext, and the output stage detects the text
//! encoding, reports the result and annotates the host.
//!
//! The analysis host is abstracted behind [`context::BinaryContext`] and the
//! rule engine behind [`matcher::PatternMatcher`]; [`image::ImageContext`]
//! and [`matcher::SignatureMatcher`] are the built-in providers.

pub mod charset;
pub mod context;
pub mod decode;
pub mod engine;
pub mod error;
pub mod families;
pub mod function;
pub mod image;
pub mod matcher;
pub mod output;
pub mod split;
pub mod string;
pub mod tracer;

pub use context::BinaryContext;
pub use engine::{run, RunContext, RunOptions, RunReport, RunStatus};
pub use error::{EngineError, EngineResult};
pub use string::{DecodedData, EncodedString, StackSlot, StringSite};

/// Returns the library version as encoded at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
