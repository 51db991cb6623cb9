pub mod app;
pub mod audit;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod output;
pub mod payload;
pub mod planner;
pub mod qbench;
pub mod workbook;
pub mod worker;
