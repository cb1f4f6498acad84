mod error;
pub mod logging;

pub mod prelude {
    pub use super::error::{Error, Result};
    pub use super::logging::prelude::*;
}

pub use error::{Error, Result};
