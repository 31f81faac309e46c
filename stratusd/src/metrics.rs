use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};

use stratus_broker::settings::MetricsSettings;

/// Serves the prometheus text exposition of the broker metrics on the
/// configured port and path.
pub async fn serve(settings: MetricsSettings) -> Result<(), hyper::Error> {
    let path = settings.path().to_string();
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port()));

    let make_svc = make_service_fn(move |_conn| {
        let path = path.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| serve_req(req, path.clone())))
        }
    });

    Server::bind(&addr).serve(make_svc).await
}

async fn serve_req(req: Request<Body>, path: String) -> Result<Response<Body>, hyper::Error> {
    if req.uri().path() != path {
        let response = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("valid response");
        return Ok(response);
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    let response = match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Body::from(buffer))
            .expect("valid response"),
        Err(_) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("valid response"),
    };

    Ok(response)
}
