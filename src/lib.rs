#[macro_use]
extern crate serde;

mod aggregator;
mod anchor;
mod authn;
mod error;
mod keystore;
mod merkle;
mod serde_hex;
mod store;
mod util;
mod verify;
mod vote;

pub use aggregator::*;
pub use anchor::*;
pub use authn::*;
pub use error::*;
pub use keystore::*;
pub use merkle::*;
pub use serde_hex::*;
pub use store::*;
pub use util::*;
pub use verify::*;
pub use vote::*;
