pub mod config;
pub mod init;
pub mod query;
pub mod run;
pub mod runs;
pub mod serve;
