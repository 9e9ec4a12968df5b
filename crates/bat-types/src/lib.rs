pub mod config;
pub mod rpc;
pub mod run;
pub mod trace;
