use salvo::prelude::*;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::web::{render_error, web_state};

/// Homeserver pushes a batch of events for the appservice.
#[handler]
pub async fn push(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let Some(processor) = web_state(depot).and_then(|state| state.matrix.clone()) else {
        render_error(res, StatusCode::NOT_FOUND, "matrix is not configured");
        return;
    };
    let txn_id = req.param::<String>("txn_id").unwrap_or_default();
    let body = match req.parse_json::<Value>().await {
        Ok(body) => body,
        Err(err) => {
            render_error(
                res,
                StatusCode::BAD_REQUEST,
                &format!("invalid transaction body: {}", err),
            );
            return;
        }
    };

    debug!("received matrix transaction {}", txn_id);
    if let Err(err) = processor.process_transaction(&txn_id, &body).await {
        error!("matrix transaction {} failed: {}", txn_id, err);
    }
    res.render(Json(json!({})));
}
