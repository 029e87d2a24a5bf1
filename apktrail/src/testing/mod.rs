#![allow(dead_code)]

mod context;
pub use context::*;

mod temp;
pub use temp::*;

mod fixtures;
pub use fixtures::*;

mod mocks;
pub use mocks::*;
