//! The IRC protocol engine.

pub mod channel;
pub mod codec;
pub mod commands;
pub mod message;
pub mod modes;
pub mod names;
pub mod oper;
pub mod registry;
pub mod replies;
pub mod server;
pub mod session;
