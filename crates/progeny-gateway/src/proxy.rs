use std::{sync::OnceLock, time::Duration};

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, Uri, header},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use progeny_process::{Backend, is_valid_session_name};
use reqwest::Url;

use crate::error::ProxyError;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "progeny_session";

/// Upper bound for a relayed JSON request body.
pub(crate) const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent("progeny-gateway")
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client")
    })
}

/// Sets the routing cookie and sends the browser to the root document.
pub async fn start_session(
    Path(session): Path<String>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), ProxyError> {
    if !is_valid_session_name(&session) {
        return Err(ProxyError::InvalidSession(session));
    }
    let mut c = Cookie::new(SESSION_COOKIE, session.clone());
    c.set_http_only(true);
    c.set_same_site(SameSite::Lax);
    c.set_path("/");
    c.set_expires(time::macros::datetime!(9999-12-31 23:59:59 UTC));
    tracing::info!(session = %session, "session cookie set");
    Ok((jar.add(c), Redirect::to("/")))
}

fn forwarded_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        let n = name.as_str();
        if HOP_BY_HOP.contains(&n)
            || *name == header::HOST
            || *name == header::COOKIE
            || *name == header::CONTENT_LENGTH
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Backend-absolute redirects become relative so the browser stays on the
/// gateway.
fn rewrite_location(location: &str, host: &str, port: u16) -> Option<String> {
    for h in [host, "localhost", "127.0.0.1", "0.0.0.0"] {
        let prefix = format!("http://{h}:{port}");
        if let Some(rest) = location.strip_prefix(&prefix) {
            if rest.is_empty() {
                return Some("/".to_string());
            }
            if rest.starts_with(['/', '?', '#']) {
                return Some(rest.to_string());
            }
        }
    }
    None
}

fn upstream_url(host: &str, backend: &Backend, uri: &Uri) -> Result<Url, ProxyError> {
    let unreachable = |reason: String| ProxyError::BackendUnreachable {
        port: backend.port,
        reason,
    };
    let mut url = Url::parse(&format!("http://{host}:{}/", backend.port))
        .map_err(|e| unreachable(e.to_string()))?;
    url.set_path(uri.path());
    url.set_query(uri.query());
    // The backend scopes a page load to a session only from the root document.
    if uri.path() == "/" {
        url.query_pairs_mut()
            .append_pair("session", &backend.session_name);
    }
    Ok(url)
}

fn count_items(body: &[u8], key: &str) -> Option<usize> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get(key)?
        .as_array()
        .map(Vec::len)
}

async fn resolve_backend(state: &AppState, jar: &CookieJar) -> Result<Backend, ProxyError> {
    let session = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(ProxyError::MissingSession)?;
    state
        .backends
        .resolve(&session)
        .await?
        .ok_or(ProxyError::UnknownSession(session))
}

/// Relay one request to the worker named by the session cookie.
///
/// GETs go without a body. POST bodies must be JSON (or empty) and are
/// forwarded re-encoded.
pub async fn relay(
    State(state): State<AppState>,
    jar: CookieJar,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let backend = resolve_backend(&state, &jar).await?;
    let url = upstream_url(&state.upstream_host, &backend, &uri)?;
    let path = uri.path();

    let mut req = http_client()
        .request(method.clone(), url)
        .headers(forwarded_request_headers(&headers))
        .timeout(state.upstream_timeout);

    if method == Method::POST && !body.is_empty() {
        let payload: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::BadRequestBody(e.to_string()))?;
        if path == "/give_answers" {
            let n = payload.get("answers").and_then(|a| a.as_array()).map(Vec::len);
            tracing::debug!(session = %backend.session_name, answers = n, "answers to be sent to DB");
        }
        req = req.json(&payload);
    }

    let upstream = req.send().await.map_err(|e| ProxyError::BackendUnreachable {
        port: backend.port,
        reason: e.to_string(),
    })?;

    let status = upstream.status();
    let mut out_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        let n = name.as_str();
        if HOP_BY_HOP.contains(&n) || *name == header::CONTENT_LENGTH {
            continue;
        }
        if *name == header::LOCATION
            && let Some(rewritten) = value
                .to_str()
                .ok()
                .and_then(|l| rewrite_location(l, &state.upstream_host, backend.port))
            && let Ok(v) = HeaderValue::from_str(&rewritten)
        {
            out_headers.append(header::LOCATION, v);
            continue;
        }
        out_headers.append(name.clone(), value.clone());
    }

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| ProxyError::BackendUnreachable {
            port: backend.port,
            reason: e.to_string(),
        })?;

    if matches!(path, "/get_questions" | "/get_session_questions")
        && let Some(n) = count_items(&bytes, "tasks")
    {
        tracing::debug!(session = %backend.session_name, tasks = n, "new tasks fetched");
    }

    let mut resp = (status, Body::from(bytes)).into_response();
    resp.headers_mut().extend(out_headers);
    Ok(resp)
}
