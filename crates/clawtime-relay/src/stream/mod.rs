//! Delta/final reassembly of streamed agent replies.

pub mod reassembler;

pub use reassembler::{Reassembler, StreamAction, is_silent_reply};
