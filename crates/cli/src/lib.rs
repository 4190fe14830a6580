//! Command-line front end of the lunaris bytecode obfuscator.

pub mod commands;
