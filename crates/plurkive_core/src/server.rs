use anyhow::{Context, Result};
use reqwest::Url;
use serde::Serialize;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Response, Server};

use crate::search::{SearchDb, SearchMode, SearchScope};

const ROUTE_BASE: &str = "http://localhost";

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(body) => Self { status: 200, body },
            Err(error) => Self::error(500, &format!("failed to encode response: {error}")),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }

    fn not_found() -> Self {
        Self::error(404, "not found")
    }
}

/// Maps a request target (`/path?query`) onto the query layer.
pub fn route_api(db: &SearchDb, target: &str) -> ApiResponse {
    let url = match Url::parse(ROUTE_BASE).and_then(|base| base.join(target)) {
        Ok(url) => url,
        Err(error) => return ApiResponse::error(400, &format!("invalid request target: {error}")),
    };
    let segments = url
        .path()
        .trim_matches('/')
        .split('/')
        .collect::<Vec<_>>();

    let outcome = match segments.as_slice() {
        ["api", "stats"] => db.get_stats().map(|stats| ApiResponse::ok(&stats)),
        ["api", "search"] => return search_route(db, &url),
        ["api", "post", id] => {
            let Ok(id) = id.parse::<i64>() else {
                return ApiResponse::not_found();
            };
            db.get_post(id).map(|found| match found {
                Some(location) => ApiResponse::ok(&location),
                None => ApiResponse::not_found(),
            })
        }
        ["api", "reply", id, "post"] => {
            let Ok(id) = id.parse::<i64>() else {
                return ApiResponse::not_found();
            };
            db.get_reply_owner(id).map(|found| match found {
                Some(location) => ApiResponse::ok(&location),
                None => ApiResponse::not_found(),
            })
        }
        _ => return ApiResponse::not_found(),
    };

    outcome.unwrap_or_else(|error| {
        log::error!("request {target} failed: {error:#}");
        ApiResponse::error(500, &format!("{error:#}"))
    })
}

fn search_route(db: &SearchDb, url: &Url) -> ApiResponse {
    let mut query = None;
    let mut scope = SearchScope::All;
    let mut mode = SearchMode::Fts;
    let mut page = 0u32;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "q" => query = Some(value.into_owned()),
            "type" => match value.parse() {
                Ok(parsed) => scope = parsed,
                Err(error) => return ApiResponse::error(400, &format!("{error:#}")),
            },
            "mode" => match value.parse() {
                Ok(parsed) => mode = parsed,
                Err(error) => return ApiResponse::error(400, &format!("{error:#}")),
            },
            "page" => match value.parse() {
                Ok(parsed) => page = parsed,
                Err(_) => {
                    return ApiResponse::error(
                        400,
                        &format!("page must be a non-negative integer, got '{value}'"),
                    );
                }
            },
            _ => {}
        }
    }

    let Some(query) = query else {
        return ApiResponse::error(400, "missing query parameter 'q'");
    };
    match db.search(&query, scope, mode, page) {
        Ok(response) => ApiResponse::ok(&response),
        Err(error) => {
            log::error!("search for '{query}' failed: {error:#}");
            ApiResponse::error(500, &format!("{error:#}"))
        }
    }
}

/// Serves the JSON API on `127.0.0.1:<port>`, one request at a time, until the
/// process is stopped.
pub fn serve(db: &SearchDb, port: u16) -> Result<()> {
    let address = format!("127.0.0.1:{port}");
    let server = Server::http(&address)
        .map_err(|error| anyhow::anyhow!("failed to bind {address}: {error}"))?;
    let content_type = Header::from_bytes(&b"Content-Type"[..], &b"application/json; charset=utf-8"[..])
        .map_err(|_| anyhow::anyhow!("invalid content-type header"))?;
    log::info!("serving JSON API on http://{address}/api/");

    for request in server.incoming_requests() {
        let target = request.url().to_string();
        let response = if *request.method() == Method::Get {
            route_api(db, &target)
        } else {
            ApiResponse::error(405, "method not allowed")
        };
        log::debug!("{} {target} -> {}", request.method(), response.status);

        let body = serde_json::to_string(&response.body).context("failed to encode response body")?;
        let reply = Response::from_string(body)
            .with_status_code(response.status)
            .with_header(content_type.clone());
        if let Err(error) = request.respond(reply) {
            log::warn!("failed to send response for {target}: {error}");
        }
    }
    Ok(())
}
