//! raven-bootmenu library
//!
//! This exposes the internal modules for testing and external use.

pub mod boot;
pub mod catalog;
pub mod config;
pub mod logbuf;
pub mod menu;
pub mod scan;
pub mod sys;
pub mod tui;
pub mod ui;
