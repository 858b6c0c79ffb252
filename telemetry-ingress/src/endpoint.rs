use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;
use telemetry_common::envelope::{IngressContext, Protocol};
use tracing::instrument;

use crate::adapter::{decode_body, Decoded};
use crate::api::{IngressError, IngressResponse};
use crate::router;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Bearer token first, then the device token header.
fn credentials(headers: &HeaderMap) -> Option<&str> {
    header(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .or_else(|| header(headers, "x-device-token"))
}

#[instrument(skip_all, fields(tenant_id, device_id, body_size))]
pub async fn telemetry(
    state: State<router::State>,
    Path((tenant_id, device_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngressResponse>, IngressError> {
    tracing::Span::current().record("tenant_id", tenant_id.as_str());
    tracing::Span::current().record("device_id", device_id.as_str());
    tracing::Span::current().record("body_size", body.len());

    let ctx = IngressContext {
        tenant_id,
        device_id,
        device_type_id: header(&headers, "x-device-type").map(str::to_owned),
        protocol: Protocol::Http,
        received_at: state.timesource.current_time(),
    };

    state
        .ingestor
        .authenticate(&ctx, credentials(&headers))
        .await?;

    let gzip = header(&headers, "content-encoding")
        .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"));

    let summary = match decode_body(&body, gzip, state.max_body_bytes)? {
        Decoded::Body(payload) => state.ingestor.ingest(&ctx, &payload).await?,
        Decoded::Corrupt(raw) => state.ingestor.ingest_malformed(&ctx, &raw).await?,
    };

    Ok(Json(IngressResponse {
        accepted: summary.accepted,
        rate_limited: summary.rate_limited,
    }))
}
