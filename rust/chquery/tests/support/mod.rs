#![allow(dead_code)]

mod harness;

#[allow(unused_imports)]
pub use harness::*;
