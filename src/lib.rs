//! Bad-block management for raw NAND flash.
//!
//! Every die keeps a reservoir of spare blocks. User blocks that fail are moved into the
//! reservoir and reached through an indirection table; blocks whose reads come back disturbed
//! are refreshed in place through a staging block. All of this state is persisted in a
//! rotating metadata log at the start of each reservoir.

pub mod config;
pub mod die;
pub mod error;
pub mod nand;
pub mod partition;
pub mod pcb;
pub mod refresh;
pub mod replace;
pub mod reservoir;
pub mod volume;
