pub mod config;
pub mod detect;
pub mod scan;
pub mod split;

pub use config::*;
pub use detect::*;
pub use scan::*;
pub use split::*;
