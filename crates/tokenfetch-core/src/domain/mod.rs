mod entity;
mod result;
mod timestamp;
mod window;

pub use entity::EntityRef;
pub use result::{FetchResult, FetchStatus, QuotePoint};
pub use timestamp::UtcDateTime;
pub use window::{FetchWindow, WindowPolicy};
