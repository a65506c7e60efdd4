use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use futures::stream;
use serde::Deserialize;
use tracing::debug;

use kimcard_machine::{Machine, MachineError};
use memory::RangeOp;

use crate::error::ApiError;

/// Keep each streamed response buffer under one TCP segment.
const STREAM_CHUNK: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<Machine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ramrom/range", get(get_range).patch(patch_range))
        .route("/ramrom/range/data", patch(patch_range_data))
        .route("/ramrom/range/enable", patch(patch_attr_enable))
        .route("/ramrom/range/disable", patch(patch_attr_disable))
        .route("/ramrom/range/setram", patch(patch_attr_setram))
        .route("/ramrom/range/setrom", patch(patch_attr_setrom))
        .route("/ramrom/video", get(get_video).put(put_video))
        .route("/ramrom/restore", put(put_restore))
        .route("/sd", get(get_dir))
        .route("/sd/dir", get(get_dir))
        .route(
            "/sd/file",
            get(get_file)
                .post(post_file)
                .patch(patch_file)
                .delete(delete_file),
        )
        .route(
            "/sd/mnt",
            get(get_mounts).post(post_mount).delete(delete_mount),
        )
        .route("/sd/mnt/save", post(post_mount_save))
        .with_state(state)
}

#[derive(Deserialize)]
struct RangeQuery {
    start: Option<String>,
    count: Option<String>,
}

#[derive(Deserialize)]
struct VideoQuery {
    address: Option<String>,
}

#[derive(Deserialize)]
struct FileQuery {
    fname: Option<String>,
    nfname: Option<String>,
    owrite: Option<String>,
}

#[derive(Deserialize)]
struct MountQuery {
    img: Option<String>,
    drive: Option<String>,
    ro: Option<String>,
}

fn require<T>(value: Option<T>) -> Result<T, ApiError> {
    value.ok_or_else(ApiError::bad_request)
}

fn parse_hex_u16(value: Option<&String>) -> Result<u16, ApiError> {
    let raw = require(value)?;
    u16::from_str_radix(raw, 16).map_err(|_| ApiError::bad_request())
}

fn parse_hex_count(value: Option<&String>) -> Result<usize, ApiError> {
    let raw = require(value)?;
    usize::from_str_radix(raw, 16).map_err(|_| ApiError::bad_request())
}

fn parse_drive(value: Option<&String>) -> Result<usize, ApiError> {
    require(value)?.parse().map_err(|_| ApiError::bad_request())
}

fn parse_flag(value: Option<&String>) -> Result<bool, ApiError> {
    match value.map(String::as_str) {
        None | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(_) => Err(ApiError::bad_request()),
    }
}

fn require_content_length(headers: &HeaderMap) -> Result<(), ApiError> {
    if headers.contains_key(header::CONTENT_LENGTH) {
        Ok(())
    } else {
        Err(ApiError::bad_request())
    }
}

async fn run_blocking<T: Send + 'static>(
    machine: Arc<Machine>,
    f: impl FnOnce(&Machine) -> Result<T, MachineError> + Send + 'static,
) -> Result<T, ApiError> {
    tokio::task::spawn_blocking(move || f(&machine))
        .await
        .map_err(|_| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            reason: "",
        })?
        .map_err(ApiError::from)
}

fn stream_body(content_type: &'static str, bytes: Vec<u8>) -> Response {
    let chunks: Vec<Result<Bytes, std::convert::Infallible>> = bytes
        .chunks(STREAM_CHUNK)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    (
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(stream::iter(chunks)),
    )
        .into_response()
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_range(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let start = parse_hex_u16(q.start.as_ref())?;
    let count = parse_hex_count(q.count.as_ref())?;
    let bytes = run_blocking(state.machine, move |m| m.read_data_range(start, count)).await?;
    Ok(stream_body("application/octet-stream", bytes))
}

async fn patch_range(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    require_content_length(&headers)?;
    let start = parse_hex_u16(q.start.as_ref())?;
    run_blocking(state.machine, move |m| m.write_raw_range(start, &body)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn patch_range_data(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    require_content_length(&headers)?;
    let start = parse_hex_u16(q.start.as_ref())?;
    run_blocking(state.machine, move |m| m.write_data_range(start, &body)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn patch_attr(
    state: AppState,
    q: RangeQuery,
    op: RangeOp,
) -> Result<StatusCode, ApiError> {
    let start = parse_hex_u16(q.start.as_ref())?;
    let count = parse_hex_count(q.count.as_ref())?;
    debug!(start, count, ?op, "range attribute change");
    run_blocking(state.machine, move |m| m.apply_range_op(start, count, op)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn patch_attr_enable(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<StatusCode, ApiError> {
    patch_attr(state, q, RangeOp::Enable).await
}

async fn patch_attr_disable(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<StatusCode, ApiError> {
    patch_attr(state, q, RangeOp::Disable).await
}

async fn patch_attr_setram(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<StatusCode, ApiError> {
    patch_attr(state, q, RangeOp::MarkRam).await
}

async fn patch_attr_setrom(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<StatusCode, ApiError> {
    patch_attr(state, q, RangeOp::MarkRom).await
}

async fn get_video(State(state): State<AppState>) -> Response {
    let address = state.machine.video_address();
    (
        [(header::CONTENT_TYPE, "text/plain")],
        format!("{address:04X}\n"),
    )
        .into_response()
}

async fn put_video(
    State(state): State<AppState>,
    Query(q): Query<VideoQuery>,
) -> Result<StatusCode, ApiError> {
    let address = parse_hex_u16(q.address.as_ref())?;
    state
        .machine
        .set_video_address(address)
        .map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_restore(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    run_blocking(state.machine, |m| m.restore_default_map()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_dir(State(state): State<AppState>) -> Result<Response, ApiError> {
    let names = run_blocking(state.machine, |m| m.list_images()).await?;
    let mut listing = String::new();
    for name in names {
        listing.push_str(&name);
        listing.push('\n');
    }
    Ok(stream_body("text/plain", listing.into_bytes()))
}

async fn get_file(
    State(state): State<AppState>,
    Query(q): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let fname = require(q.fname)?;
    let bytes = run_blocking(state.machine, move |m| m.download_image(&fname)).await?;
    Ok(stream_body("application/octet-stream", bytes))
}

async fn post_file(
    State(state): State<AppState>,
    Query(q): Query<FileQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let fname = require(q.fname)?;
    let overwrite = parse_flag(q.owrite.as_ref())?;
    match q.nfname {
        Some(nfname) => {
            run_blocking(state.machine, move |m| {
                m.copy_image(&fname, &nfname, overwrite)
            })
            .await?;
        }
        None => {
            require_content_length(&headers)?;
            run_blocking(state.machine, move |m| {
                m.upload_image(&fname, &body, overwrite)
            })
            .await?;
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn patch_file(
    State(state): State<AppState>,
    Query(q): Query<FileQuery>,
) -> Result<StatusCode, ApiError> {
    let fname = require(q.fname)?;
    let nfname = require(q.nfname)?;
    run_blocking(state.machine, move |m| m.rename_image(&fname, &nfname)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_file(
    State(state): State<AppState>,
    Query(q): Query<FileQuery>,
) -> Result<StatusCode, ApiError> {
    let fname = require(q.fname)?;
    run_blocking(state.machine, move |m| m.erase_image(&fname)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_mounts(State(state): State<AppState>) -> Result<Response, ApiError> {
    let mounts = run_blocking(state.machine, |m| m.mounts()).await?;
    let mut listing = String::new();
    for (drive, image, read_only) in mounts {
        let mode = if read_only { "ro" } else { "rw" };
        listing.push_str(&format!("{drive} {image} {mode}\n"));
    }
    Ok(stream_body("text/plain", listing.into_bytes()))
}

async fn post_mount(
    State(state): State<AppState>,
    Query(q): Query<MountQuery>,
) -> Result<StatusCode, ApiError> {
    let img = require(q.img)?;
    let drive = parse_drive(q.drive.as_ref())?;
    let read_only = parse_flag(q.ro.as_ref())?;
    run_blocking(state.machine, move |m| m.mount(drive, &img, read_only)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_mount(
    State(state): State<AppState>,
    Query(q): Query<MountQuery>,
) -> Result<StatusCode, ApiError> {
    let drive = parse_drive(q.drive.as_ref())?;
    run_blocking(state.machine, move |m| m.unmount(drive)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_mount_save(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    run_blocking(state.machine, |m| m.save_mounts()).await?;
    Ok(StatusCode::NO_CONTENT)
}
