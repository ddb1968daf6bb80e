//! Plain-text HTTP responses shared by the proxy and admin fronts

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Helper to create a simple response - infallible with valid StatusCode
pub fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Plain-text error response, used for 500-class failures on the proxy
/// front and 400-class rejections on the admin front.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.into())))
        .expect("valid response with StatusCode enum and static header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_status() {
        let resp = response(StatusCode::OK, "OK");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_response_is_plain_text() {
        let resp = error_response(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
