//! Offline-capable edge cache controller.
//!
//! Intercepts read traffic for one origin, answers it from versioned caches
//! according to per-class strategies, queues writes made while offline and
//! replays them when a sync trigger arrives.

pub mod cache;
pub mod config;
pub mod control;
pub mod controller;
pub mod db;
pub mod host;
pub mod http;
pub mod lifecycle;
pub mod network;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod strategy;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;
