//! # Cinder language model
//!
//! Types, symbols, expression trees and the statement arena produced by the front end
//! and consumed by the code generator.

pub mod expr;
pub mod node;
pub mod symbol;
pub mod types;
