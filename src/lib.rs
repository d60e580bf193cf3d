pub mod actuator;
pub mod bus;
pub mod config;
pub mod controller;
pub mod entity;
pub mod hardware;
pub mod pid;
pub mod schedule;
pub mod shutdown;
pub mod simulator;
