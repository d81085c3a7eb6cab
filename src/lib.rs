//! On-demand Minecraft server gateway. The library crate exposes the
//! protocol codec, handshake classifier, status responder, login gatekeeper,
//! backend lifecycle controller, TCP splicer, registry loader, event logger,
//! notification fan-out, and listener supervisor described in the design
//! document; `main.rs` wires them into a running daemon.

pub mod adapter;
pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod listener;
pub mod login;
pub mod notify;
pub mod splice;
pub mod status;
