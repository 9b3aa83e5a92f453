//! Core value types shared by handlers and strategies.

pub mod value;

pub use value::{Row, SqlNullType, SqlValue};
