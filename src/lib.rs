#![doc = include_str!("../README.md")]
#![warn(
    missing_docs,
    rustdoc::missing_crate_level_docs,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
#![allow(
    clippy::unreadable_literal,
    clippy::cognitive_complexity,
    clippy::float_cmp,
    clippy::match_like_matches_macro,
    clippy::derive_partial_eq_without_eq
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod options;

pub use ::bson;

mod bson_util;
mod client;
pub mod cmap;
mod concern;
pub mod cursor;
pub mod error;
mod namespace;
mod operation;
pub mod retry;
pub(crate) mod runtime;
pub mod sdam;
mod selection_criteria;
mod serde_util;
pub mod timeout;
mod trace;

pub use futures_core::future::BoxFuture;

pub use crate::{
    client::{
        session::{ClientSession, ClusterTime},
        Client,
    },
    cursor::{Cursor, SessionCursor},
    namespace::Namespace,
};
