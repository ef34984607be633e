//! Request router
//!
//! Patterns have the form `[METHOD ]host?/path`. A path ending in `/` names
//! a subtree and matches every path below it; any other path matches only
//! itself. Patterns with a host take precedence over patterns without, exact
//! paths over subtrees, and longer subtrees over shorter ones.

use super::request::Request;
use super::response::ResponseWriter;
use super::server::{handler_fn, Handler};
use super::url::strip_host_port;
use super::{Error, Method, Result, Status};
use log::debug;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, OnceLock, RwLock};

struct Route {
    pattern: String,
    method: Option<Method>,
    host: String,
    path: String,
    handler: Arc<dyn Handler>,
}

impl Route {
    /// 0 for no match, higher is more specific
    fn method_rank(&self, method: &Method) -> u8 {
        match &self.method {
            None => 1,
            Some(m) if m == method => 2,
            Some(Method::Get) if *method == Method::Head => 2,
            Some(_) => 0,
        }
    }
}

/// Dispatches requests to the handler registered for the most specific
/// matching pattern. Unmatched requests get `404 Not Found`.
pub struct Router {
    routes: RwLock<Vec<Route>>,
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        f.debug_list()
            .entries(routes.iter().map(|r| r.pattern.as_str()))
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Register `handler` for `pattern`.
    ///
    /// Fails on a malformed pattern or one that is already registered.
    pub fn handle(&self, pattern: &str, handler: impl Handler + 'static) -> Result<()> {
        let (method, host, path) = parse_pattern(pattern)?;
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes
            .iter()
            .any(|r| r.method == method && r.host == host && r.path == path)
        {
            return Err(Error::DuplicatePattern(pattern.to_string()));
        }
        debug!("route registered: {}", pattern);
        routes.push(Route {
            pattern: pattern.to_string(),
            method,
            host,
            path,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Register a closure for `pattern`
    pub fn handle_func<F>(&self, pattern: &str, f: F) -> Result<()>
    where
        F: Fn(&mut ResponseWriter, &mut Request<'_>) + Send + Sync + 'static,
    {
        self.handle(pattern, handler_fn(f))
    }

    /// Look up the handler for a request to `host` and `path`, ignoring
    /// redirects. Returns the matched pattern, empty when nothing matched.
    pub fn resolve(&self, method: &Method, host: &str, path: &str) -> (Arc<dyn Handler>, String) {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        match find(&routes, method, strip_host_port(host), path) {
            Some(route) => (route.handler.clone(), route.pattern.clone()),
            None => (not_found(), String::new()),
        }
    }

    /// Handler for `req`, including the redirects to a cleaned path and
    /// from `/tree` to a registered `/tree/`.
    pub fn handler(&self, req: &Request<'_>) -> (Arc<dyn Handler>, String) {
        let host = strip_host_port(req.host());
        let path = req.url().path.as_str();
        if *req.method() == Method::Connect {
            return self.resolve(req.method(), host, path);
        }

        let cleaned = clean_path(path);
        if cleaned != path {
            return (redirect(&cleaned, &req.url().raw_query), String::new());
        }
        if self.should_redirect_to_slash(req.method(), host, path) {
            let location = format!("{}/", path);
            return (redirect(&location, &req.url().raw_query), String::new());
        }
        self.resolve(req.method(), host, path)
    }

    fn should_redirect_to_slash(&self, method: &Method, host: &str, path: &str) -> bool {
        if path.ends_with('/') {
            return false;
        }
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let exact = |p: &str| {
            routes.iter().any(|r| {
                r.path == p && (r.host.is_empty() || r.host.eq_ignore_ascii_case(host)) && r.method_rank(method) > 0
            })
        };
        !exact(path) && exact(&format!("{}/", path))
    }
}

impl Handler for Router {
    fn serve_http(&self, w: &mut ResponseWriter, req: &mut Request<'_>) {
        if req.request_uri() == "*" {
            if req.proto_at_least(1, 1) {
                w.set_close(true);
            }
            w.send_error(Status::BAD_REQUEST, "400 Bad Request");
            return;
        }
        let (handler, _) = self.handler(req);
        handler.serve_http(w, req);
    }
}

/// Process-wide router, created on first use
pub fn default_router() -> &'static Router {
    static DEFAULT: OnceLock<Router> = OnceLock::new();
    DEFAULT.get_or_init(Router::new)
}

fn parse_pattern(pattern: &str) -> Result<(Option<Method>, String, String)> {
    let invalid = || Error::InvalidPattern(pattern.to_string());
    let (method, rest) = match pattern.split_once(' ') {
        Some((method, rest)) => {
            let method = Method::from_str(method).map_err(|_| invalid())?;
            (Some(method), rest.trim_start_matches(' '))
        }
        None => (None, pattern),
    };
    let slash = rest.find('/').ok_or_else(invalid)?;
    let (host, path) = rest.split_at(slash);
    if path.contains(' ') || host.contains(' ') {
        return Err(invalid());
    }
    Ok((method, host.to_string(), path.to_string()))
}

fn find<'r>(routes: &'r [Route], method: &Method, host: &str, path: &str) -> Option<&'r Route> {
    let with_host = [host, ""];
    let hosts: &[&str] = if routes.iter().any(|r| !r.host.is_empty()) {
        &with_host
    } else {
        &with_host[1..]
    };
    for h in hosts {
        let candidates = routes
            .iter()
            .filter(|r| r.host.eq_ignore_ascii_case(h) && r.method_rank(method) > 0);
        let exact = candidates
            .clone()
            .filter(|r| r.path == path)
            .max_by_key(|r| r.method_rank(method));
        if exact.is_some() {
            return exact;
        }
        let subtree = candidates
            .filter(|r| r.path.ends_with('/') && path.starts_with(&r.path))
            .max_by_key(|r| (r.path.len(), r.method_rank(method)));
        if subtree.is_some() {
            return subtree;
        }
    }
    None
}

/// Canonical form of a request path: rooted, without `.`/`..` segments or
/// repeated slashes. A trailing slash is kept.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut cleaned = format!("/{}", segments.join("/"));
    if path.ends_with('/') && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

fn not_found() -> Arc<dyn Handler> {
    Arc::new(handler_fn(|w, _req| {
        w.send_error(Status::NOT_FOUND, "404 page not found")
    }))
}

fn redirect(path: &str, raw_query: &str) -> Arc<dyn Handler> {
    let mut location = path.to_string();
    if !raw_query.is_empty() {
        location.push('?');
        location.push_str(raw_query);
    }
    Arc::new(handler_fn(move |w, req| {
        w.headers_mut().set("Location", location.as_str());
        if matches!(req.method(), Method::Get | Method::Head) {
            w.headers_mut().set("Content-Type", "text/html; charset=utf-8");
            w.write_header(Status::MOVED_PERMANENTLY);
            let body = format!("<a href=\"{}\">Moved Permanently</a>.\n", location);
            let _ = w.write_all(body.as_bytes());
        } else {
            w.write_header(Status::MOVED_PERMANENTLY);
        }
    }))
}
