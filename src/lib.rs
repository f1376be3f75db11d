//! Barbaric voice agent core.
//!
//! Speech in, speech out, and a plan interpreter that drives the desktop
//! (shell, keyboard, mouse, screen text) on behalf of a language model.

pub mod assistant;
pub mod capture;
pub mod config;
pub mod effectors;
pub mod ipc;
pub mod logger;
pub mod plan;
pub mod skills;
pub mod speech;
pub mod supervisor;
