pub mod collector;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod domain;
pub mod forecast;
pub mod inverter;
pub mod pricing;
pub mod safety;
pub mod selling;
pub mod storage;
pub mod telemetry;
