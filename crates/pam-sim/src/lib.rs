//! PAM Controller Simulation Library
//!
//! This crate provides a simulation layer for exercising the PAM driver
//! without the physical controller. It includes:
//!
//! - **VirtualPam**: Models the firmware registers and answers console lines
//! - **VirtualPort**: An async byte stream onto a shared `VirtualPam`, with
//!   fault injection for I/O errors and failed opens
//!
//! # Example
//!
//! ```rust
//! use pam_sim::VirtualPam;
//!
//! let mut pam = VirtualPam::new("bench");
//! assert_eq!(pam.handle_line("FUNCTION 196"), "OK\r\n>");
//! assert_eq!(pam.handle_line("FUNCTION"), "196\r\n>");
//! ```

pub mod controller;
pub mod port;

pub use controller::{SharedPam, VirtualPam, VirtualPamConfig, RECEIVED_HISTORY};
pub use port::VirtualPort;
