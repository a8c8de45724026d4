pub mod download;
pub mod models;
pub mod transcribe;

pub use download::*;
pub use models::*;
pub use transcribe::*;
