pub mod connection;
pub mod hub;
pub mod proto;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

pub use connection::GatewayContext;
pub use hub::Hub;

const WIRE_SUBPROTOCOL: &str = "sovereign.v1";

/// The gateway's sole route. `axum`'s upgrade negotiates the
/// `sovereign.v1` subprotocol -- reject anything else rather than silently
/// falling back to an unframed transport.
pub fn router(ctx: Arc<GatewayContext>) -> Router {
    Router::new().route("/ws", get(upgrade)).with_state(ctx)
}

async fn upgrade(ws: WebSocketUpgrade, State(ctx): State<Arc<GatewayContext>>) -> Response {
    ws.protocols([WIRE_SUBPROTOCOL])
        .on_upgrade(move |socket| connection::handle_socket(socket, ctx))
}
