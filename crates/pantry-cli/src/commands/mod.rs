pub mod common;
pub mod compare;
pub mod detect;
pub mod resolve;
