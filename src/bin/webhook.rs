use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use operator::webhook;
use std::convert::Infallible;
use std::env;
use tracing::*;
use warp::{Filter, Reply, reply};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let listen_port = env::var("ADC_WEBHOOK_PORT")
        .unwrap_or("9443".to_string())
        .parse::<u16>()?;
    let listen_ip = env::var("ADC_WEBHOOK_IP")
        .unwrap_or("0.0.0.0".to_string())
        .parse::<std::net::IpAddr>()?;
    let cert_path = env::var("ADC_WEBHOOK_TLS_CERT_FILE").unwrap_or("tls.crt".to_string());
    let key_path = env::var("ADC_WEBHOOK_TLS_KEY_FILE").unwrap_or("tls.key".to_string());

    let routes = warp::path("validate-akodeploymentconfig")
        .and(warp::path::end())
        .and(warp::body::json())
        .and_then(validate_handler)
        .with(warp::trace::request());

    info!("serving AKODeploymentConfig admission on {listen_ip}:{listen_port}");
    warp::serve(warp::post().and(routes))
        .tls()
        .cert_path(cert_path)
        .key_path(key_path)
        .run((listen_ip, listen_port))
        .await;
    Ok(())
}

async fn validate_handler(body: AdmissionReview<DynamicObject>) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err.to_string());
            return Ok(reply::json(
                &AdmissionResponse::invalid(err.to_string()).into_review(),
            ));
        }
    };
    // Wrap the AdmissionResponse wrapped in an AdmissionReview
    Ok(reply::json(&webhook::review(&req).into_review()))
}
