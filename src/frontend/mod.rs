pub mod lexer;
pub mod parse_error;
pub mod parser;
pub mod resolve;
pub mod token;
pub mod token_dumper;
