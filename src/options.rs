//! Contains all of the types needed to configure a client, its sessions, its transactions, and the
//! commands and cursors run through it.
//!
//! The options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API on them:
//!
//! ```rust
//! # use std::time::Duration;
//! # use mongodb_opexec::options::ClientOptions;
//! let options = ClientOptions::builder()
//!     .timeout(Duration::from_secs(5))
//!     .retry_writes(true)
//!     .build();
//! ```

pub use crate::{
    client::options::*,
    concern::*,
    cursor::TimeoutMode,
    retry::{RetryableWriteLabelPolicy, WireVersionLabelPolicy},
    selection_criteria::*,
};
