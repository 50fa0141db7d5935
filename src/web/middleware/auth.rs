use salvo::prelude::*;

use crate::web::{render_error, web_state};

/// Token presented by the homeserver, from the `Authorization` header or the legacy query parameter.
fn presented_token(req: &Request) -> Option<String> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    header.or_else(|| req.query::<String>("access_token"))
}

#[handler]
pub async fn require_homeserver_token(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    ctrl: &mut FlowCtrl,
) {
    let expected = web_state(depot).and_then(|state| state.homeserver_token.clone());
    let authorized = match (expected, presented_token(req)) {
        (Some(expected), Some(presented)) => expected == presented,
        _ => false,
    };

    if authorized {
        ctrl.call_next(req, depot, res).await;
    } else {
        render_error(res, StatusCode::FORBIDDEN, "invalid homeserver token");
        ctrl.skip_rest();
    }
}
