use std::convert::Infallible;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use log::{debug, error, info, warn};
use multer::{Constraints, Multipart, SizeLimit};
use serde::Serialize;

use landmark_serve::{Error, ErrorKind, ModelHost, ModelLoader};

const INDEX: &str = include_str!("index.html");

/// Multipart field carrying the image.
const FILE_FIELD: &str = "file";

pub struct AppState<L: ModelLoader> {
    pub host: ModelHost<L>,
    pub max_upload_bytes: u64,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => respond(status, "application/json", bytes),
        Err(e) => {
            error!("could not serialize response: {}", e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "application/json",
                r#"{"error":"internal error"}"#,
            )
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json(status, &ErrorBody { error: message })
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    respond(status, "text/plain; charset=utf-8", body)
}

/// Client-facing response for a failed classification.
///
/// Server-side failures are logged in full and answered with an opaque message.
fn error_response(err: &Error) -> Response<Body> {
    match err.kind() {
        ErrorKind::Client => {
            warn!("rejected upload: {}", err);
            json_error(StatusCode::BAD_REQUEST, &err.to_string())
        }
        ErrorKind::Unprocessable => {
            warn!("rejected upload: {}", err);
            json_error(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string())
        }
        ErrorKind::NotReady => {
            error!("model not ready: {}", err);
            json_error(StatusCode::SERVICE_UNAVAILABLE, "model is not ready")
        }
        ErrorKind::Internal => {
            error!("classification failed: {}", err);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn bad_request(message: &str) -> Response<Body> {
    error_response(&Error::BadRequest(message.to_owned()))
}

fn multipart_error(err: multer::Error) -> Response<Body> {
    match err {
        multer::Error::StreamSizeExceeded { limit }
        | multer::Error::FieldSizeExceeded { limit, .. } => {
            warn!("upload exceeds {} bytes", limit);
            json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("upload exceeds {} bytes", limit),
            )
        }
        other => bad_request(&format!("malformed multipart body: {}", other)),
    }
}

/// Pull the single image out of a multipart upload.
///
/// Fields without a filename are form values, not files, and are skipped.
async fn read_upload(req: Request<Body>, limit: u64) -> Result<Vec<u8>, Response<Body>> {
    let boundary = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or_else(|| bad_request("no file uploaded"))?;

    let constraints = Constraints::new().size_limit(SizeLimit::new().whole_stream(limit));
    let mut multipart = Multipart::with_constraints(req.into_body(), boundary, constraints);

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        match field.file_name() {
            None => continue,
            Some("") => return Err(bad_request("no file selected")),
            Some(name) => debug!("receiving {}", name),
        }

        if upload.is_some() {
            return Err(bad_request("multiple files uploaded"));
        }

        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some(bytes.to_vec());
    }

    upload.ok_or_else(|| bad_request("no file uploaded"))
}

async fn predict<L>(req: Request<Body>, state: Arc<AppState<L>>) -> Response<Body>
where
    L: ModelLoader + 'static,
{
    let image = match read_upload(req, state.max_upload_bytes).await {
        Ok(image) => image,
        Err(rejection) => return rejection,
    };

    // decoding, loading and the forward pass all block
    let outcome = tokio::task::spawn_blocking(move || state.host.classify(&image)).await;

    match outcome {
        Ok(Ok(classification)) => {
            info!(
                "classified as {} ({:.3}), samples: {:?}",
                classification.predicted_class,
                classification.probability,
                classification.sample_count
            );
            json(StatusCode::OK, &classification)
        }
        Ok(Err(err)) => error_response(&err),
        Err(err) => {
            error!("classification task failed: {}", err);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub async fn handle<L>(
    req: Request<Body>,
    state: Arc<AppState<L>>,
) -> Result<Response<Body>, Infallible>
where
    L: ModelLoader + 'static,
{
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => respond(StatusCode::OK, "text/html; charset=utf-8", INDEX),
        (&Method::POST, "/predict") => predict(req, state).await,
        (&Method::GET, "/healthz") => text(StatusCode::OK, "OK"),
        (_, "/") | (_, "/predict") | (_, "/healthz") => {
            text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    debug!("{} {} -> {}", method, path, response.status());

    Ok(response)
}
