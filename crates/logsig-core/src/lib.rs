//! Core primitives for block-signed log streams.
//!
//! Provides algorithm-tagged hash imprints, the tag/length/value framing used
//! by every persisted artifact, and a clock abstraction so that block timing
//! can be driven deterministically in tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod hash;
pub mod time;
pub mod tlv;

pub use error::{CoreError, Result};
pub use hash::{hash_node, DataHasher, HashAlgorithm, Imprint};
pub use time::{Clock, RealClock};
pub use tlv::{Tlv, TlvReader};
