use std::sync::Arc;

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data};
use operator::{
    adc_controller, cluster_controller, config::OperatorConfig, phases::Shared, telemetry,
};
use serde_json::json;
use tracing::*;

#[derive(Clone)]
struct States {
    adc: adc_controller::State,
    cluster: cluster_controller::State,
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<States>, _req: HttpRequest) -> impl Responder {
    let adc = c.adc.diagnostics().await;
    let cluster = c.cluster.diagnostics().await;
    HttpResponse::Ok().json(json!({
        "akodeploymentconfig": adc,
        "cluster": cluster,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::from_env();
    telemetry::init(config.log_format).await;
    info!(
        bootstrap = config.bootstrap_cluster,
        ha_provider = config.ha_provider,
        management_cluster = config.management_cluster_name.as_deref().unwrap_or_default(),
        "starting ako-operator"
    );

    let addr = config.health_addr.clone();
    let shared = Arc::new(Shared::new(config));
    let client = kube::Client::try_default().await?;

    let states = States {
        adc: adc_controller::State::new(shared.clone()),
        cluster: cluster_controller::State::new(shared),
    };
    let adc_ctrl = adc_controller::run_adc(states.adc.clone(), client.clone());
    let cluster_ctrl = cluster_controller::run_cluster(states.cluster.clone(), client);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(states.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(addr)?
    .shutdown_timeout(5);

    // All runtimes implements graceful shutdown, so poll until all are done
    let (_, _, server_result) = tokio::join!(adc_ctrl, cluster_ctrl, server.run());
    server_result?;
    Ok(())
}
