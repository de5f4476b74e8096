pub mod schema;
pub mod selectors;

pub use schema::{AppConfig, Config, Limits, ScreenMarkers, StorageConfig};
pub use selectors::{DismissStrategy, Selector};
