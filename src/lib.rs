#[macro_use]
extern crate num_derive;

pub mod client;
pub mod config;
