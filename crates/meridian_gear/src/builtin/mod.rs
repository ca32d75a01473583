//! Built-in gears shipped with the runtime.

mod clock;
mod file_manager;
mod http;

pub use clock::ClockGear;
pub use file_manager::FileManagerGear;
pub use http::HttpGear;
