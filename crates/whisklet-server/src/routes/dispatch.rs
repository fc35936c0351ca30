use crate::error::{error_response, AppError};
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use whisklet_core::sandbox::InvocationResult;

/// Fallback handler: the invocation dispatcher.
///
/// Matches the request path against the route table (longest prefix wins),
/// assembles the action's argument object, resolves the effective environment
/// exactly once, invokes the sandbox, and translates the outcome into a
/// response. `OPTIONS` short-circuits before any of that, so preflights never
/// count as invocations.
pub async fn dispatch(
    State(app): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }

    let path = uri.path().to_string();
    let Some((action, stripped)) = app.table.match_path(&path) else {
        return error_response(
            StatusCode::NOT_FOUND,
            &format!("no action registered for {path}"),
        );
    };

    let started = Instant::now();
    let args = build_args(&method, &headers, &stripped, query, &body);
    let env = whisklet_core::env::resolve(
        &action.environment,
        &app.global_env,
        &whisklet_core::env::process_env(),
    );

    app.record_invocation();
    let outcome = app.sandbox.invoke(&action, Value::Object(args), env).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(result) => {
            tracing::info!(route = %action.route, status = result.status, elapsed_ms, "invocation complete");
            translate(result)
        }
        Err(err) => {
            let err = AppError::from(err);
            tracing::warn!(route = %action.route, status = %err.status(), elapsed_ms, "invocation failed: {}", err.0);
            err.into_response()
        }
    }
}

/// Build the single argument object handed to the action: reserved metadata
/// first, then query parameters, then JSON body fields. Each later layer
/// overwrites identically-named keys from an earlier one.
fn build_args(
    method: &Method,
    headers: &HeaderMap,
    path: &str,
    query: HashMap<String, String>,
    body: &[u8],
) -> serde_json::Map<String, Value> {
    let mut header_map = serde_json::Map::new();
    for (name, value) in headers {
        header_map.insert(
            name.as_str().to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }

    let mut args = serde_json::Map::new();
    args.insert(
        "__ow_method".to_string(),
        Value::String(method.as_str().to_string()),
    );
    args.insert("__ow_headers".to_string(), Value::Object(header_map));
    args.insert("__ow_path".to_string(), Value::String(path.to_string()));

    for (key, value) in query {
        args.insert(key, Value::String(value));
    }

    if !body.is_empty() {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => {
                for (key, value) in fields {
                    args.insert(key, value);
                }
            }
            _ => tracing::debug!("request body is not a JSON object; ignored"),
        }
    }

    args
}

/// Copy result headers onto the transport response, set the status, and
/// serialize the body as JSON. The response Content-Type is always
/// `application/json`; invalid header names or values from the action are
/// dropped with a warning rather than failing the request.
fn translate(result: InvocationResult) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in &result.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => tracing::warn!("dropping invalid response header '{name}'"),
        }
    }

    let body = match &result.body {
        Some(value) => match serde_json::to_vec(value) {
            Ok(bytes) => Body::from(bytes),
            Err(e) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("cannot serialize action response: {e}"),
                )
            }
        },
        None => Body::empty(),
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(result.status).unwrap_or(StatusCode::OK);
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn reserved_metadata_comes_first() {
        let headers = HeaderMap::new();
        let args = build_args(&Method::GET, &headers, "/sub/path", HashMap::new(), b"");
        assert_eq!(args["__ow_method"], "GET");
        assert_eq!(args["__ow_path"], "/sub/path");
        assert!(args["__ow_headers"].is_object());
    }

    #[test]
    fn query_params_arrive_as_strings() {
        let mut query = HashMap::new();
        query.insert("x".to_string(), "1".to_string());
        let args = build_args(&Method::GET, &HeaderMap::new(), "", query, b"");
        assert_eq!(args["x"], "1");
    }

    #[test]
    fn body_fields_overwrite_query_params() {
        let mut query = HashMap::new();
        query.insert("x".to_string(), "from-query".to_string());
        let args = build_args(
            &Method::POST,
            &HeaderMap::new(),
            "",
            query,
            br#"{"x": 42, "y": 2}"#,
        );
        assert_eq!(args["x"], 42);
        assert_eq!(args["y"], 2);
    }

    #[test]
    fn non_object_body_is_ignored() {
        let args = build_args(&Method::POST, &HeaderMap::new(), "", HashMap::new(), b"[1,2]");
        assert!(!args.contains_key("0"));
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn headers_are_exposed_under_ow_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("abc"));
        let args = build_args(&Method::GET, &headers, "", HashMap::new(), b"");
        assert_eq!(args["__ow_headers"]["x-custom"], "abc");
    }

    #[test]
    fn translate_copies_headers_and_status() {
        let mut result_headers = BTreeMap::new();
        result_headers.insert("X-Test".to_string(), "1".to_string());
        let response = translate(InvocationResult {
            status: 201,
            headers: result_headers,
            body: Some(serde_json::json!({ "ok": true })),
        });
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-test"], "1");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn translate_drops_invalid_header_names() {
        let mut result_headers = BTreeMap::new();
        result_headers.insert("bad header\n".to_string(), "1".to_string());
        let response = translate(InvocationResult {
            status: 200,
            headers: result_headers,
            body: Some(serde_json::json!({})),
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().len(), 1);
    }
}
