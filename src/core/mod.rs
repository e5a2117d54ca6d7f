pub mod dispatcher;
pub mod error;
pub mod negotiate;
pub mod panic;
pub mod request_log;
pub mod response;
pub mod server;

pub use dispatcher::{Dispatched, Dispatcher, Encoding};
pub use error::{CallStack, Frame, ReportableError, RequestError};
pub use negotiate::accepts_gzip;
pub use request_log::RequestLog;
pub use response::{Body, Response, SerializeBody};
pub use server::{HandlerFuture, LoggedHandler, Request, Server};
