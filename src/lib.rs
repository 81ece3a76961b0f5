#![doc = include_str!("../README.md")]

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod app_test;

pub mod app;
pub mod comm;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod partition;
pub mod pe;
pub mod server;
pub mod state;
pub mod stream;

pub use app::*;
pub use comm::*;
pub use dispatch::*;
pub use error::*;
pub use event::*;
pub use partition::*;
pub use pe::*;
pub use server::*;
pub use state::*;
pub use stream::*;
