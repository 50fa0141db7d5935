use chrono::Utc;
use salvo::prelude::*;
use serde_json::{Value, json};
use tracing::error;

use crate::db::{DatabaseError, DatabaseManager, MappingKind};
use crate::web::{render_error, web_state};

/// Which side of a mapping the query key names.
#[derive(Debug, Clone, Copy)]
enum Side {
    A,
    B,
}

async fn lookup(
    db: &DatabaseManager,
    kind: MappingKind,
    side: Side,
    key: &str,
) -> Result<Option<String>, DatabaseError> {
    let store = db.mapping_store(kind);
    match side {
        Side::A => store.lookup_by_a(key).await,
        Side::B => store.lookup_by_b(key).await,
    }
}

async fn render_lookup(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    kind: MappingKind,
    side: Side,
    param: &str,
    field: &str,
) {
    let Some(state) = web_state(depot) else {
        render_error(res, StatusCode::SERVICE_UNAVAILABLE, "bridge is starting");
        return;
    };
    let key = match req.query::<String>(param) {
        Some(v) if !v.is_empty() => v,
        _ => {
            render_error(
                res,
                StatusCode::BAD_REQUEST,
                &format!("missing {param} query parameter"),
            );
            return;
        }
    };

    match lookup(&state.bridge.db(), kind, side, &key).await {
        Ok(Some(value)) => {
            let mut body = serde_json::Map::new();
            body.insert(field.to_string(), Value::String(value));
            res.render(Json(Value::Object(body)));
        }
        Ok(None) => render_error(res, StatusCode::NOT_FOUND, "no mapping found"),
        Err(err) => {
            error!("mapping lookup failed param={} key={} error={}", param, key, err);
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    }
}

#[handler]
pub async fn info(depot: &mut Depot, res: &mut Response) {
    let Some(state) = web_state(depot) else {
        render_error(res, StatusCode::INTERNAL_SERVER_ERROR, "bridge is not initialized");
        return;
    };
    match state.bridge.identity() {
        Some(identity) => res.render(Json(json!({
            "bridgeIdentity": identity,
            "dataSpaceAccountId": state.bridge.space_account_id(),
        }))),
        None => render_error(
            res,
            StatusCode::INTERNAL_SERVER_ERROR,
            "bridge identity is not initialized",
        ),
    }
}

#[handler]
pub async fn get_guild_id(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    render_lookup(req, depot, res, MappingKind::GuildSpace, Side::B, "spaceId", "guildId").await;
}

#[handler]
pub async fn get_space_id(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    render_lookup(req, depot, res, MappingKind::GuildSpace, Side::A, "guildId", "spaceId").await;
}

#[handler]
pub async fn get_matrix_space_id(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    render_lookup(
        req,
        depot,
        res,
        MappingKind::MatrixSpace,
        Side::B,
        "spaceId",
        "matrixSpaceId",
    )
    .await;
}

#[handler]
pub async fn get_space_id_for_matrix(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    render_lookup(
        req,
        depot,
        res,
        MappingKind::MatrixSpace,
        Side::A,
        "matrixSpaceId",
        "spaceId",
    )
    .await;
}

#[handler]
pub async fn health(res: &mut Response) {
    res.render(Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    })));
}

#[handler]
pub async fn status(depot: &mut Depot, res: &mut Response) {
    let Some(state) = web_state(depot) else {
        render_error(res, StatusCode::SERVICE_UNAVAILABLE, "bridge is starting");
        return;
    };
    let bridge = &state.bridge;
    res.render(Json(json!({
        "status": if bridge.is_accepting() { "running" } else { "stopping" },
        "uptime_seconds": bridge.uptime().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "requests": bridge.stats(),
    })));
}
