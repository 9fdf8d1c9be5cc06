//! Converts staged response state into a concrete HTTP response.
//!
//! Both engine adapters run [`finalize`] on the same [`ResponseState`], so
//! the status line, `Content-Type`, and `Set-Cookie` output is identical
//! regardless of the engine — the parity the adapter test matrix asserts.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue, SET_COOKIE};
use http::{Response, StatusCode};
use tracing::warn;

use crate::context::{ResponseBody, ResponseState};
use crate::error::HttpError;

/// Builds the final response from staged state.
///
/// A `File` body is read here; a vanished or unreadable file degrades to the
/// error envelope rather than a broken stream.
pub async fn finalize(state: ResponseState) -> Response<Bytes> {
    let (content_type, data, file_status) = match state.body {
        ResponseBody::None => (None, Bytes::new(), None),
        ResponseBody::Bytes { content_type, data } => (Some(content_type), data, None),
        ResponseBody::File(path) => match tokio::fs::read(&path).await {
            Ok(contents) => {
                let mime = mime_guess::from_path(&path).first_or_octet_stream();
                (Some(mime.to_string()), Bytes::from(contents), None)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "staged file became unreadable");
                let envelope = HttpError::internal("file response failed").to_envelope(None);
                (
                    Some("application/json".to_string()),
                    Bytes::from(envelope.to_string()),
                    Some(StatusCode::INTERNAL_SERVER_ERROR),
                )
            }
        },
    };

    let status = file_status
        .or(state.status)
        .unwrap_or(StatusCode::OK);
    let mut response = Response::builder().status(status);

    if let Some(headers) = response.headers_mut() {
        for (name, value) in &state.headers {
            let Ok(name) = name.parse::<HeaderName>() else {
                warn!(header = %name, "dropping invalid response header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                warn!(header = %name, "dropping invalid response header value");
                continue;
            };
            headers.append(name, value);
        }
        if let Some(content_type) = content_type {
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                headers.insert(CONTENT_TYPE, value);
            }
        }
        for cookie in &state.cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie.to_set_cookie()) {
                headers.append(SET_COOKIE, value);
            } else {
                warn!(cookie = %cookie.name, "dropping unserializable cookie");
            }
        }
    }

    // The builder only fails on an invalid status or header, both filtered
    // above.
    response
        .body(data)
        .unwrap_or_else(|_| Response::new(Bytes::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::Cookie;

    #[tokio::test]
    async fn defaults_to_200_with_empty_body() {
        let response = finalize(ResponseState::default()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body().is_empty());
        assert!(response.headers().get(CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn emits_headers_cookies_and_content_type() {
        let state = ResponseState {
            status: Some(StatusCode::CREATED),
            headers: vec![("x-request-id".into(), "r-1".into())],
            cookies: vec![
                Cookie::new("a", "1").with_path("/"),
                Cookie::new("b", "2"),
            ],
            body: ResponseBody::Bytes {
                content_type: "application/json".into(),
                data: Bytes::from_static(b"{}"),
            },
        };
        let response = finalize(state).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let cookies: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0], "a=1; Path=/");
    }

    #[tokio::test]
    async fn missing_file_degrades_to_error_envelope() {
        let state = ResponseState {
            status: Some(StatusCode::OK),
            headers: Vec::new(),
            cookies: Vec::new(),
            body: ResponseBody::File("/definitely/not/here.txt".into()),
        };
        let response = finalize(state).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            String::from_utf8_lossy(response.body()).contains("INTERNAL_ERROR")
        );
    }
}
