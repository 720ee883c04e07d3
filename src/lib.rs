//! Emulates Nintendo Switch controllers over Bluetooth and drives them with
//! live input or text macros.

pub mod bluetooth;
pub mod config;
pub mod controller;
pub mod persistence;
pub mod supervisor;
