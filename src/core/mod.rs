// Core modules implementing the ordered store, page fetching, and error modeling.
pub mod error;
pub mod fetcher;
pub mod period;
pub mod query;
pub mod store;
pub mod value;
pub mod window;
