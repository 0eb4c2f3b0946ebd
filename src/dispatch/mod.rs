pub mod dispatcher;

pub use dispatcher::{ClientStream, DispatchRequest, DispatchResponse, Dispatcher};
