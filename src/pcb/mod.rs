//! The metadata log: every change to a reservoir is persisted as a self-contained meta-page unit,
//! appended to one of two rotating pool-control blocks (PCBs).
//!
//! Each die has an Unlockable PCB (UPCB), a Lockable PCB (LPCB), and a Temp PCB (TPCB). Units
//! are appended to the active block of a role while it has room; when it is full (or its content
//! cannot be trusted), the role swaps blocks with the TPCB, which is erased and written from page
//! 0. Programming pages of a block that was written before a power loss is never attempted, so
//! no page is ever programmed twice.

pub mod layout;
pub mod log;
pub mod scan;
