mod commands;
mod parse;

pub(crate) use commands::run;
pub(crate) use parse::Cli;
