//! Stateright Model Checking for batch-fanout
//!
//! Exhaustive state-space exploration of the completion protocol, sitting
//! next to the DST harness in `fanout::dst`:
//!
//! ```text
//!     ┌──────────────────────────────────────┐
//!     │   Stateright   │      DST Tests      │
//!     │  (Exhaustive)  │    (Simulation)     │
//!     └──────────────────────────────────────┘
//!                     ↓
//!     ┌──────────────────────────────────────┐
//!     │   CompletionState::apply (shared)    │
//!     └──────────────────────────────────────┘
//! ```
//!
//! ## Available Models
//!
//! - `completion`: signal ordering, duplicate delivery and completion soundness
//!
//! ## Running Model Checks
//!
//! ```bash
//! cargo test stateright -- --ignored --nocapture
//! ```

pub mod completion;
