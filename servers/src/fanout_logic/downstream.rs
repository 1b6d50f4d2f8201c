use crate::fanout_logic::config::Settings;
use crate::fanout_logic::protocol::{ClientMessage, ServerMessage};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures_util::{SinkExt, StreamExt};
use lib_fanout::identity::extract_credential;
use lib_fanout::{Broker, ConnectionSession, IdentityGate};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    broker: Broker,
    gate: Arc<IdentityGate>,
}

impl AppState {
    pub fn new(broker: Broker, gate: IdentityGate) -> Self {
        Self { broker, gate: Arc::new(gate) }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct WsQuery {
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run(settings: Settings, state: AppState, handle: Handle) -> Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some(tls) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key).await?;
        log::info!("Downstream server listening on wss://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        log::info!("Downstream server listening on ws://{}", addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    log::info!("Downstream server stopped.");
    Ok(())
}

/// Runs the identity gate before upgrading; a rejected caller never reaches
/// the broker.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let credential = extract_credential(authorization, query.token.as_deref());

    let admission = match state.gate.admit(credential.as_deref()).await {
        Ok(admission) => admission,
        Err(e) => {
            log::warn!("Rejected WebSocket connection: {}", e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let session = match state.broker.connect(admission.rooms).await {
        Ok(session) => session,
        Err(e) => {
            log::warn!("Refusing WebSocket connection: {}", e);
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };
    log::info!(
        "Client {} connected{}",
        session.id(),
        admission.subject.map(|s| format!(" as {}", s)).unwrap_or_default()
    );

    let accepts_subscribe = admission.accepts_subscribe;
    ws.on_upgrade(move |socket| handle_socket(socket, session, state.broker, accepts_subscribe))
}

async fn status_handler(State(state): State<AppState>) -> Response {
    match state.broker.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn handle_socket(socket: WebSocket, mut session: ConnectionSession, broker: Broker, accepts_subscribe: bool) {
    let client_id = session.id();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = on_client_frame(&session, &broker, accepts_subscribe, text.as_str()).await {
                        if sender.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = session.recv() => match event {
                Some(event) => {
                    if sender.send(Message::Text(event.frame.clone().into())).await.is_err() {
                        break; // client disconnected
                    }
                }
                // Broker is shutting down.
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    // Dropping the session leaves every room.
    drop(session);
    log::info!("Client {} disconnected", client_id);
}

async fn on_client_frame(
    session: &ConnectionSession,
    broker: &Broker,
    accepts_subscribe: bool,
    text: &str,
) -> Option<String> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Client {} sent an unparsable frame: {}", session.id(), e);
            return None;
        }
    };

    let reply = match message {
        ClientMessage::Subscribe { .. } if !accepts_subscribe => {
            log::warn!("Client {} tried to subscribe on an identity-routed connection", session.id());
            return None;
        }
        ClientMessage::Subscribe { rooms } => match session.set_rooms(rooms).await {
            Ok(update) => {
                if !update.rejected.is_empty() {
                    log::warn!("Client {} requested unknown rooms: {:?}", session.id(), update.rejected);
                }
                let current = broker
                    .rooms_of(session.id())
                    .unwrap_or_default()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                ServerMessage::subscribed(current, update)
            }
            Err(e) => ServerMessage::error(e.to_string()),
        },
    };

    serde_json::to_string(&reply).ok()
}
