use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data};
use clap::Parser;
use ekspose::{
    config::Config,
    controller::{Controller, State},
    telemetry,
};
use kube::Client;
use tracing::*;

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;
    let config = Config::parse();
    debug!("{:?}", config);

    let client = Client::try_default().await?;
    let state = State::default();
    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(config.listen_addr.as_str())?
    .shutdown_timeout(5)
    .disable_signals()
    .run();
    let server_handle = server.handle();

    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    let controller = Controller::new(client, config, state);
    let ctrl = async {
        let res = controller.start(stop).await;
        // the web server only lives as long as the controller
        server_handle.stop(true).await;
        res
    };

    let (ctrl_result, server_result) = tokio::join!(ctrl, server);
    server_result?;
    ctrl_result?;
    Ok(())
}
