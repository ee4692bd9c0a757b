#![deny(clippy::unwrap_used)]

//! Pooled, authenticated remote PowerShell execution against Windows hosts
//! over WinRM.

pub mod bridge;
