use percent_encoding::percent_decode_str;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, error};
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::reply::{self, Reply, Response};
use warp::Filter;

use super::Registry;

/// Serves `GET <base_url><key>/<name>` by handing `name` to the producer
/// registered under `key`.
pub fn routes(
    base_url: &str,
    registry: Arc<Registry>,
) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    let base_url = base_url.to_string();
    warp::method()
        .and(warp::path::full())
        .and(warp::any().map(move || base_url.clone()))
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(dispatch)
}

async fn dispatch(
    method: Method,
    path: FullPath,
    base_url: String,
    registry: Arc<Registry>,
) -> Result<Response, Infallible> {
    // names are matched decoded, `/csv/my%20file` reads `my file.csv`
    let path = percent_decode_str(path.as_str()).decode_utf8_lossy();
    let Some(rel) = path.strip_prefix(base_url.as_str()) else {
        return Ok(not_found());
    };
    let segs: Vec<&str> = rel.split('/').collect();
    let &[key, name] = segs.as_slice() else {
        return Ok(not_found());
    };

    let Some(producer) = registry.get(key) else {
        return Ok(text(
            StatusCode::NOT_IMPLEMENTED,
            format!("{} is not supported", key),
        ));
    };
    if method != Method::GET {
        return Ok(text(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{} is not allowed", method),
        ));
    }

    debug!(key, source = name, "producing");
    let mut body = Vec::new();
    match producer.html(&mut body, name).await {
        Ok(()) => Ok(reply::html(body).into_response()),
        Err(err) if err.is_not_found() => Ok(not_found()),
        Err(err) => {
            error!(key, source = name, error = %err, "can't produce output");
            Ok(text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Can't produce output".to_string(),
            ))
        }
    }
}

fn text(status: StatusCode, msg: String) -> Response {
    reply::with_status(format!("{}\n", msg), status).into_response()
}

fn not_found() -> Response {
    text(StatusCode::NOT_FOUND, "404 page not found".to_string())
}
