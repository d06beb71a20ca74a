pub mod cli;
pub mod errors;
pub mod interpreter;
pub mod models;
pub mod runner;
pub mod services;
pub mod storage;
pub mod supervisor;
