//! Change observation on the endpoint: stable identity tags and the
//! kernel-notification observer.

pub mod observer;
pub mod tag_store;

pub use observer::Observer;
