//! # EMBERLINK Core
//!
//! Plain-data types shared between the gameplay layers and the transport
//! stack. Everything here is `Copy`, `Pod` and fixed-size so it can cross
//! the wire boundary without allocation or reinterpretation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod types;

pub use types::{EntityId, Position};
