pub mod request;
pub mod response;

pub use request::{HttpRequest, Method, ParsingState, RequestParser};
pub use response::{format_http_date, HttpResponse, StatusCode, SERVER_NAME};
