pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod fs_util;
pub mod merge;
pub mod model;
pub mod naming;
pub mod output;
pub mod reconcile;
pub mod stats;
pub mod store;
pub mod tracking;
pub mod tui;
