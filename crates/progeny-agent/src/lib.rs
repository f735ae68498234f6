pub mod config;
pub mod error;
pub mod port_alloc;
pub mod process_manager;
pub mod process_manager_support;
pub mod recipes;
pub mod spinner;
pub mod templates;
mod worker;

pub use error::{Error, Result};
pub use spinner::Progeny;
