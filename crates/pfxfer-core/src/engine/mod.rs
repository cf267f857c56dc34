//! Transfer Engine - The heart of pfxfer
//!
//! This module implements a bandwidth-limited, chunked download engine with:
//! - Blocking token limiters shared per traffic class
//! - A periodic provider refilling the limiters
//! - Limited reader/writer wrappers over std::io
//! - Strictly ordered, resumable downloads into staging files

mod bandwidth_limiter;
mod bandwidth_provider;
mod download;
mod limited_stream;
mod manager;
mod transfer_counter;

pub use bandwidth_limiter::*;
pub use bandwidth_provider::*;
pub use download::*;
pub use limited_stream::*;
pub use manager::*;
pub use transfer_counter::*;
