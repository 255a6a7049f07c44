//! # Govee LAN Control Library
//!
//! `govee-lan-lib` is a Rust library for controlling lights that speak the
//! vendor's local-network UDP protocol (the "LAN API"). It provides a
//! retrying command client, multi-interface device discovery, a daily
//! automation scheduler, and a bounded log of outgoing packets for
//! diagnostics.
//!
//! ## Features
//!
//! - Device discovery on every local IPv4 interface via multicast and broadcast
//! - Power, brightness, RGB color, color temperature and scene commands
//! - Daily time-of-day automation rules that fire once per minute per day
//! - A ring buffer of the last packets sent, with hex and text dumps
//!
//! ## Example
//!
//! Here is a simple example of how to find devices and turn the first one on:
//!
//! ```no_run
//! use govee_lan_lib::control_interface::ControlInterface;
//! use govee_lan_lib::util::discovery::Discovery;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let devices = Discovery::find_devices(Duration::from_secs(2)).await;
//!
//!     if let Some(device) = devices.first() {
//!         let control = ControlInterface::new(&device.ip_address.to_string());
//!         control.turn_on().await;
//!         println!("Status: {:?}", control.get_status().await);
//!     }
//! }
//! ```
//!
//! Commands never fail: a device that does not answer yields `None` after the
//! configured retries, the same as a device that is offline.
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Govee or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// The `control_interface` module provides the protocol client for a single
// device: the shared device target, the retry policy, and the convenience
// commands built on top of a raw send.
//
// Example usage:
//
// ```
// use govee_lan_lib::control_interface::ControlInterface;
//
// #[tokio::main]
// async fn main() {
//     let control = ControlInterface::new("192.168.1.66");
//     control.set_rgb(255, 80, 0).await;
// }
// ```
pub mod control_interface;

// The `automation` module contains the daily rule model, the rule file
// format, and the background scheduler that fires due rules.
pub mod automation;

// The `util` module holds the wire envelope, the transport and probe traits
// with their UDP implementations, device discovery, and the packet monitor.
pub mod util;
