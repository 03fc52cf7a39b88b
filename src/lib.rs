#![doc = include_str!("../README.md")]

pub use crate::config::*;
pub use crate::error::{Error, SinkStatus};
pub use crate::sink::FsSink;

pub mod config;
pub mod error;
pub mod ir;

pub(crate) mod ctfser;
pub(crate) mod ident;
pub(crate) mod meta;
pub(crate) mod sink;
pub(crate) mod translate;
pub(crate) mod tsdl;
