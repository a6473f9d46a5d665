use std::{env, net::SocketAddr};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use partyline_proto::{EventBus, RoomHub, RoomStats};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4201";

/// Per-connection outbound frame buffer; a receiver this far behind starts
/// losing frames, which the best-effort protocol tolerates.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Clone)]
struct AppState {
    hub: RoomHub,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    rooms: usize,
    connections: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("partyline-hub");

    let bind_addr = env::var("HUB_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let socket_addr: SocketAddr = bind_addr.parse()?;

    let state = AppState {
        hub: RoomHub::new(EventBus::default()),
    };

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/v0/status", get(status))
        .route("/v0/rooms", get(list_rooms))
        // Everything else is a room address: ws://host/{party}/{room}
        .route("/{party}/{room}", get(ws_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    info!(%socket_addr, "hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    global::shutdown_tracer_provider();
    Ok(())
}

fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("partyline_hub=info,partyline_proto=info,tower_http=info"));
    let fmt_layer = tracing_subscriber::fmt::layer().compact().with_target(false);

    if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_owned()),
                ])),
            )
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio);

        match provider {
            Ok(provider) => {
                let tracer = provider.tracer(service_name.to_owned());
                global::set_tracer_provider(provider);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                info!("tracing initialized with OpenTelemetry OTLP exporter");
                return;
            }
            Err(error) => {
                eprintln!("failed to initialize OTLP exporter: {error}");
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    info!("tracing initialized (stdout only)");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "partyline-hub",
    })
}

/// GET /v0/status — Aggregate room and connection counts.
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.hub.stats().await;
    Json(StatusResponse {
        status: "ok",
        rooms: stats.len(),
        connections: stats.iter().map(|s| s.connections).sum(),
    })
}

/// GET /v0/rooms — Per-room stats.
async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomStats>> {
    Json(state.hub.stats().await)
}

/// GET /{party}/{room} — Upgrade to the relay WebSocket.
async fn ws_upgrade(
    State(state): State<AppState>,
    Path((party, room)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| relay_connection(state.hub, party, room, socket))
}

/// Drive one relay connection: frames queued by the hub go out on the
/// socket, text frames from the socket go into the hub, and either side
/// closing tears the connection down.
async fn relay_connection(hub: RoomHub, party: String, room: String, socket: WebSocket) {
    let (conn_id, mut outbound) = hub.connect(&party, &room, OUTBOUND_BUFFER).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = hub.message(&party, &room, &conn_id, text.as_str()).await {
                            warn!(%conn_id, %err, "closing connection after hub rejection");
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(%conn_id, "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ping/pong keepalives are answered by axum itself.
                    }
                    Some(Err(err)) => {
                        warn!(%conn_id, %err, "websocket transport error");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(&party, &room, &conn_id).await;
    info!(%party, %room, %conn_id, "relay connection finished");
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
