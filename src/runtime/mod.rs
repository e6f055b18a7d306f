pub mod native;
pub mod prelude;
pub mod runtime_error;
pub mod stack;
pub mod vm;
