//! Canonical data types shared across the engine.
//!
//! Every venue adapter translates its wire shapes into these types at the
//! adapter boundary; the manager, multiplexer, scorer, router, and
//! reconciler never see venue-specific vocabulary.

pub mod enums;
pub mod market;
pub mod trading;

pub use enums::*;
pub use market::*;
pub use trading::*;
