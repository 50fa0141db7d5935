use std::sync::Arc;

use anyhow::Result;
use salvo::affix_state;
use salvo::prelude::*;
use serde_json::json;
use tracing::info;

use crate::bridge::BridgeCore;
use crate::config::ApiConfig;
use crate::matrix::MatrixEventProcessor;

pub mod handlers;
pub mod middleware;

use self::handlers::{bridge, transactions};
use self::middleware::auth::require_homeserver_token;

#[derive(Clone)]
pub struct WebState {
    pub bridge: Arc<BridgeCore>,
    pub matrix: Option<Arc<MatrixEventProcessor>>,
    pub homeserver_token: Option<String>,
}

pub fn web_state(depot: &Depot) -> Option<&WebState> {
    depot.obtain::<WebState>().ok()
}

pub(crate) fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

pub fn create_router(state: WebState) -> Router {
    let transactions = Router::new()
        .hoop(require_homeserver_token)
        .push(Router::with_path("_matrix/app/v1/transactions/{txn_id}").put(transactions::push))
        .push(Router::with_path("transactions/{txn_id}").put(transactions::push));

    Router::new()
        .hoop(affix_state::inject(state))
        .push(Router::with_path("info").get(bridge::info))
        .push(Router::with_path("get-guild-id").get(bridge::get_guild_id))
        .push(Router::with_path("get-space-id").get(bridge::get_space_id))
        .push(Router::with_path("get-matrix-space-id").get(bridge::get_matrix_space_id))
        .push(Router::with_path("get-space-id-for-matrix").get(bridge::get_space_id_for_matrix))
        .push(Router::with_path("health").get(bridge::health))
        .push(Router::with_path("status").get(bridge::status))
        .push(transactions)
}

pub struct WebServer {
    config: ApiConfig,
    state: WebState,
}

impl WebServer {
    pub fn new(config: ApiConfig, state: WebState) -> Self {
        Self { config, state }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        info!("starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor)
            .serve(create_router(self.state.clone()))
            .await;

        Ok(())
    }
}
