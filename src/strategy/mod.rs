//! Request classification and the per-class caching strategies.

mod executor;
mod selector;

pub use executor::{Served, ServedFrom, Strategies};
pub use selector::{classify, RequestClass};
