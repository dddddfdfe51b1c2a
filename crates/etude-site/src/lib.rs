//! File-sharing site on top of `etude-core`: login and registration, upload,
//! download, delete and a generated file-list page.

pub mod config;
pub mod error;
pub mod handler;
pub mod listing;
pub mod multipart;
pub mod names;
pub mod store;

pub use config::SiteConfig;
pub use error::{SiteError, SiteResult};
pub use handler::SiteHandler;
pub use store::{StorePool, UserStore};
