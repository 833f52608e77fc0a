// placer — device placement and colocation for dataflow graphs
//
// Library root. Graph model and placement passes first, then the .pgd
// front end and output formats.

pub mod colocation;
pub mod config;
pub mod device;
pub mod eager;
pub mod error;
pub mod frames;
pub mod graph;
pub mod handles;
pub mod id;
pub mod registry;
pub mod resolve;
pub mod rewrite;
pub mod validate;

pub mod pass;
pub mod pipeline;

pub mod ast;
pub mod build;
pub mod diag;
pub mod dot;
pub mod lexer;
pub mod parser;
