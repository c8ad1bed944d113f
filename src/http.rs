// src/http.rs
//
// Control port: on-demand clips for the chat front end plus buffer status.

use std::fs::File;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use log::{debug, error, info};
use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

use crate::compose::ComposePipeline;
use crate::media::MediaTool;
use crate::types::{ComposeRequest, Source, SourceId};

const DEFAULT_CLIP_SECS: u64 = 60;

pub fn start_http_server<T: MediaTool + 'static>(
    bind: &str,
    pipeline: Arc<ComposePipeline<T>>,
    sources: Vec<Source>,
    runtime: tokio::runtime::Handle,
) -> anyhow::Result<SocketAddr> {
    let server = Server::http(bind).map_err(|e| anyhow::anyhow!(e))?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| anyhow::anyhow!("{} is not an ip listener", bind))?;
    let sources = Arc::new(sources);

    info!("[http] server on {}", addr);

    thread::spawn(move || {
        for req in server.incoming_requests() {
            if req.method() != &Method::Get {
                let _ = req.respond(Response::empty(StatusCode(405)));
                continue;
            }

            match path_only(req.url()) {
                "/clip" => {
                    debug!("[http] clip requested: {}", req.url());
                    let pipeline = pipeline.clone();
                    let sources = sources.clone();
                    let runtime = runtime.clone();
                    thread::spawn(move || handle_clip(req, &pipeline, &sources, &runtime));
                }
                "/status" => handle_status(req, &pipeline, &sources),
                "/health" => {
                    let _ = req.respond(Response::from_string("ok"));
                }
                _ => {
                    let _ = req.respond(Response::empty(StatusCode(404)));
                }
            }
        }
    });

    Ok(addr)
}

fn handle_clip<T: MediaTool>(
    req: Request,
    pipeline: &ComposePipeline<T>,
    sources: &[Source],
    runtime: &tokio::runtime::Handle,
) {
    let url = req.url().to_string();
    let source_id = query_param(&url, "source").and_then(|v| v.parse::<SourceId>().ok());
    let requester = query_param(&url, "user").filter(|u| !u.is_empty());

    let (Some(source_id), Some(requester)) = (source_id, requester) else {
        let _ = req.respond(
            Response::from_string("source and user are required").with_status_code(StatusCode(400)),
        );
        return;
    };
    if !sources.iter().any(|s| s.id == source_id) {
        let _ = req.respond(Response::from_string("unknown source").with_status_code(StatusCode(404)));
        return;
    }

    let seconds = query_param(&url, "seconds")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CLIP_SECS);
    let offset = query_param(&url, "offset")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let compose_req = ComposeRequest::recent(source_id, requester, seconds).with_offset(offset);
    let clip = match runtime.block_on(pipeline.compose(&compose_req)) {
        Ok(clip) => clip,
        Err(e) => {
            let status = if e.is_empty_buffer() { 404 } else { 500 };
            let _ = req.respond(
                Response::from_string(e.user_message()).with_status_code(StatusCode(status)),
            );
            return;
        }
    };

    let cleanup = clip.cleanup_guard();
    match File::open(&clip.output) {
        Ok(file) => {
            let mut response = Response::from_file(file);
            if let Ok(h) = Header::from_bytes("Content-Type", "video/mp4") {
                response = response.with_header(h);
            }
            if let Err(e) = req.respond(response) {
                debug!("[http] client gone: {}", e);
            }
        }
        Err(e) => {
            error!("[http] failed to open {:?}: {}", clip.output, e);
            let _ = req.respond(Response::empty(StatusCode(500)));
        }
    }

    drop(cleanup);
    debug!("[http] removed clip files for {}", compose_req.requester);
}

fn handle_status<T: MediaTool>(req: Request, pipeline: &ComposePipeline<T>, sources: &[Source]) {
    let now = SystemTime::now();
    let store = pipeline.store();

    let entries: Vec<_> = sources
        .iter()
        .map(|s| {
            let segments = store.list(s.id).unwrap_or_default();
            let newest_age_secs = segments
                .last()
                .and_then(|seg| now.duration_since(seg.modified).ok())
                .map(|d| d.as_secs());
            json!({
                "id": s.id,
                "name": s.name,
                "segments": segments.len(),
                "ring_size": store.ring_size(),
                "newest_age_secs": newest_age_secs,
            })
        })
        .collect();

    let body = json!({ "sources": entries }).to_string();
    let mut response = Response::from_string(body);
    if let Ok(h) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(h);
    }
    let _ = req.respond(response);
}

fn path_only(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn query_param(url: &str, key: &str) -> Option<String> {
    let q = url.split_once('?')?.1;
    q.split('&').find_map(|part| {
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        if k != key {
            return None;
        }
        urlencoding::decode(v).ok().map(|v| v.into_owned())
    })
}
