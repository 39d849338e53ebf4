mod logs;
mod root;
mod run;
mod sessions;

pub use root::Cli;
