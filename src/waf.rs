//! Per-domain scripted request filter
//!
//! Executes a domain-supplied Lua script against each proxied request with a
//! small, fixed subset of the OpenResty API: `request`/`ngx.var` read-only
//! views, `ngx.header` response-header accumulation, `ngx.say`/`ngx.print`
//! body buffering, `ngx.exit` for blocking, and `ngx.shared.cache`, a
//! process-global key/value map shared across all domains and requests.
//!
//! Interpreter instances are pooled and leased exclusively per execution;
//! per-request globals are reset on each borrow so no request state leaks
//! between executions.

use std::collections::HashMap;
use std::sync::Arc;

use mlua::{Lua, MultiValue, Table, Value, Variadic};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

/// `ngx.exit` terminates the script through the interpreter's error unwind;
/// this marker distinguishes that expected exit from a real script error.
const EXIT_SENTINEL: &str = "ngx_exit";

/// Values the shared cache can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Int(i64),
    Str(String),
}

type SharedCache = Arc<RwLock<HashMap<String, CacheValue>>>;

/// Request view handed to the script.
#[derive(Debug, Clone, Default)]
pub struct FilterRequest {
    pub method: String,
    /// Path plus query, as received.
    pub uri: String,
    pub host: String,
    /// Peer IP with the port already stripped.
    pub remote_addr: String,
    /// First value per header name.
    pub headers: Vec<(String, String)>,
}

/// Outcome of a filter run. Headers are returned on allowed requests too so
/// security-header scripts keep working.
#[derive(Debug, Clone)]
pub struct FilterResponse {
    pub status_code: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl Default for FilterResponse {
    fn default() -> Self {
        Self {
            status_code: 403,
            body: String::new(),
            headers: Vec::new(),
        }
    }
}

/// Pooled script engine. One instance serves every domain; the script text
/// arrives per call.
pub struct ScriptFilter {
    pool: Mutex<Vec<Lua>>,
    shared_cache: SharedCache,
}

impl ScriptFilter {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            shared_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run `script` against `request`. Returns `(blocked, response)`.
    ///
    /// A script error that is not the `ngx.exit` unwind is logged and the
    /// request proceeds unfiltered.
    pub fn execute(&self, script: &str, request: &FilterRequest) -> (bool, FilterResponse) {
        let lua = self.pool.lock().pop().unwrap_or_else(Lua::new);
        let result = self.execute_on(&lua, script, request);
        self.pool.lock().push(lua);

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "script filter setup error, request proceeds");
                (false, FilterResponse::default())
            }
        }
    }

    fn execute_on(
        &self,
        lua: &Lua,
        script: &str,
        request: &FilterRequest,
    ) -> mlua::Result<(bool, FilterResponse)> {
        let globals = lua.globals();

        // Reset per-request state from any previous lease of this instance.
        globals.set("_blocked", Value::Nil)?;
        globals.set("_status_code", 403)?;
        globals.set("_body", Value::Nil)?;

        let request_table = lua.create_table()?;
        request_table.set("method", request.method.as_str())?;
        request_table.set("uri", request.uri.as_str())?;
        request_table.set("host", request.host.as_str())?;
        request_table.set("remote_addr", request.remote_addr.as_str())?;
        let headers_table = lua.create_table()?;
        for (name, value) in &request.headers {
            headers_table.set(name.as_str(), value.as_str())?;
        }
        request_table.set("headers", headers_table)?;
        globals.set("request", request_table)?;

        self.install_ngx_api(lua, request)?;

        if let Err(e) = lua.load(script).exec() {
            if !e.to_string().contains(EXIT_SENTINEL) {
                warn!(error = %e, "script execution error, request proceeds unfiltered");
                return Ok((false, FilterResponse::default()));
            }
            // ngx.exit() fired: fall through to collect the verdict.
        }

        let headers = collect_headers(lua)?;

        let blocked = match lua.globals().get::<_, Value>("_blocked")? {
            Value::Nil | Value::Boolean(false) => false,
            _ => true,
        };

        if !blocked {
            return Ok((
                false,
                FilterResponse {
                    headers,
                    ..FilterResponse::default()
                },
            ));
        }

        let status_code = match lua.globals().get::<_, Value>("_status_code")? {
            Value::Integer(code) => code as u16,
            Value::Number(code) => code as u16,
            other => {
                warn!(got = other.type_name(), "invalid _status_code type, using 403");
                403
            }
        };

        let mut body = match lua.globals().get::<_, Value>("_body")? {
            Value::Nil => String::new(),
            Value::String(s) => s.to_str()?.to_string(),
            other => {
                warn!(got = other.type_name(), "invalid _body type, using default");
                String::new()
            }
        };
        if body.is_empty() {
            body = "Blocked by WAF".to_string();
        }

        debug!(status_code, "request blocked by script filter");
        Ok((
            true,
            FilterResponse {
                status_code,
                body,
                headers,
            },
        ))
    }

    /// Bind the `ngx` surface for one execution.
    fn install_ngx_api(&self, lua: &Lua, request: &FilterRequest) -> mlua::Result<()> {
        let ngx = lua.create_table()?;

        ngx.set(
            "exit",
            lua.create_function(|lua, code: i64| -> mlua::Result<()> {
                let globals = lua.globals();
                globals.set("_blocked", true)?;
                globals.set("_status_code", code)?;
                Err(mlua::Error::RuntimeError(EXIT_SENTINEL.to_string()))
            })?,
        )?;

        // ngx.var.* aliases of the request view; request_uri mirrors uri.
        let var = lua.create_table()?;
        var.set("remote_addr", request.remote_addr.as_str())?;
        var.set("uri", request.uri.as_str())?;
        var.set("request_uri", request.uri.as_str())?;
        var.set("host", request.host.as_str())?;
        var.set("method", request.method.as_str())?;
        ngx.set("var", var)?;

        let shared = lua.create_table()?;
        shared.set("cache", self.create_shared_cache(lua)?)?;
        ngx.set("shared", shared)?;

        ngx.set("header", lua.create_table()?)?;

        // say and print both append to the body buffer, no newline.
        let append_body = |lua: &Lua, text: String| -> mlua::Result<()> {
            let globals = lua.globals();
            match globals.get::<_, Value>("_body")? {
                Value::String(current) => {
                    globals.set("_body", format!("{}{}", current.to_str()?, text))?
                }
                _ => globals.set("_body", text)?,
            }
            Ok(())
        };
        ngx.set("say", lua.create_function(move |lua, text: String| append_body(lua, text))?)?;
        ngx.set("print", lua.create_function(move |lua, text: String| append_body(lua, text))?)?;

        lua.globals().set("ngx", ngx)
    }

    /// The process-global cache methods. Readers take the shared lock,
    /// `set`/`incr` the exclusive one. A trailing expiry argument is accepted
    /// for compatibility and ignored; entries never expire.
    fn create_shared_cache<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        let cache = lua.create_table()?;

        let store = self.shared_cache.clone();
        cache.set(
            "get",
            lua.create_function(move |lua, (_this, key): (Table, String)| {
                match store.read().get(&key) {
                    Some(CacheValue::Int(v)) => Ok(Value::Integer(*v)),
                    Some(CacheValue::Str(v)) => Ok(Value::String(lua.create_string(v)?)),
                    None => Ok(Value::Nil),
                }
            })?,
        )?;

        let store = self.shared_cache.clone();
        cache.set(
            "set",
            lua.create_function(
                move |_, (_this, key, value, _extra): (Table, String, Value, Variadic<Value>)| {
                    match value {
                        Value::Integer(v) => {
                            store.write().insert(key, CacheValue::Int(v));
                        }
                        Value::Number(v) => {
                            store.write().insert(key, CacheValue::Int(v as i64));
                        }
                        Value::String(v) => {
                            store
                                .write()
                                .insert(key, CacheValue::Str(v.to_str()?.to_string()));
                        }
                        // Other types are silently not stored.
                        _ => {}
                    }
                    Ok(true)
                },
            )?,
        )?;

        let store = self.shared_cache.clone();
        cache.set(
            "incr",
            lua.create_function(
                move |_,
                      (_this, key, delta, initial, _extra): (
                    Table,
                    String,
                    i64,
                    Option<i64>,
                    Variadic<Value>,
                )| {
                    let initial = initial.unwrap_or(0);
                    let mut map = store.write();
                    let current = map.get(&key).cloned();
                    match current {
                        None => {
                            let value = initial + delta;
                            map.insert(key, CacheValue::Int(value));
                            Ok(MultiValue::from_vec(vec![Value::Integer(value)]))
                        }
                        Some(CacheValue::Int(current)) => {
                            let value = current + delta;
                            map.insert(key, CacheValue::Int(value));
                            Ok(MultiValue::from_vec(vec![Value::Integer(value)]))
                        }
                        Some(CacheValue::Str(_)) => Ok(MultiValue::from_vec(vec![Value::Nil])),
                    }
                },
            )?,
        )?;

        Ok(cache)
    }

}

/// Headers the script wrote into `ngx.header`, with the key casing it used.
/// Non-string entries are skipped.
fn collect_headers(lua: &Lua) -> mlua::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    let ngx: Value = lua.globals().get("ngx")?;
    if let Value::Table(ngx) = ngx {
        if let Ok(Value::Table(table)) = ngx.get::<_, Value>("header") {
            for pair in table.pairs::<Value, Value>() {
                let (key, value) = pair?;
                if let (Value::String(key), Value::String(value)) = (key, value) {
                    headers.push((key.to_str()?.to_string(), value.to_str()?.to_string()));
                }
            }
        }
    }
    Ok(headers)
}

impl Default for ScriptFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ip: &str, uri: &str) -> FilterRequest {
        FilterRequest {
            method: "GET".to_string(),
            uri: uri.to_string(),
            host: "example.com".to_string(),
            remote_addr: ip.to_string(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn blocks_a_specific_ip() {
        let waf = ScriptFilter::new();
        let script = r#"
            if ngx.var.remote_addr == "1.2.3.4" then
                return ngx.exit(403)
            end
        "#;

        let (blocked, response) = waf.execute(script, &request("1.2.3.4", "/test"));
        assert!(blocked);
        assert_eq!(response.status_code, 403);
        assert_eq!(response.body, "Blocked by WAF");

        let (blocked, _) = waf.execute(script, &request("5.6.7.8", "/test"));
        assert!(!blocked);
    }

    #[test]
    fn blocks_sql_injection_patterns_in_uri() {
        let waf = ScriptFilter::new();
        let script = r#"
            local uri = string.lower(ngx.var.uri)
            if string.find(uri, "union") and string.find(uri, "select") then
                return ngx.exit(403)
            end
        "#;

        let (blocked, _) = waf.execute(script, &request("1.1.1.1", "/test?id=1%20UNION%20SELECT"));
        assert!(blocked);
        let (blocked, _) = waf.execute(script, &request("1.1.1.1", "/test?id=1"));
        assert!(!blocked);
    }

    #[test]
    fn headers_are_returned_on_allowed_requests() {
        let waf = ScriptFilter::new();
        let script = r#"
            ngx.header["X-Frame-Options"] = "DENY"
            ngx.header["X-Content-Type-Options"] = "nosniff"
        "#;

        let (blocked, response) = waf.execute(script, &request("1.1.1.1", "/"));
        assert!(!blocked);
        assert!(response
            .headers
            .contains(&("X-Frame-Options".to_string(), "DENY".to_string())));
        assert!(response
            .headers
            .contains(&("X-Content-Type-Options".to_string(), "nosniff".to_string())));
    }

    #[test]
    fn rate_limit_blocks_the_seventh_request() {
        let waf = ScriptFilter::new();
        let script = r#"
            local ip = ngx.var.remote_addr
            local limit_key = "rate_limit:" .. ip
            local count = ngx.shared.cache:get(limit_key) or 0

            if count > 5 then
                return ngx.exit(429)
            end

            ngx.shared.cache:incr(limit_key, 1, 0, 60)
        "#;

        for i in 0..6 {
            let (blocked, _) = waf.execute(script, &request("9.8.7.6", "/test"));
            assert!(!blocked, "request {} should pass", i + 1);
        }

        let (blocked, response) = waf.execute(script, &request("9.8.7.6", "/test"));
        assert!(blocked);
        assert_eq!(response.status_code, 429);
    }

    #[test]
    fn shared_cache_is_shared_across_executions() {
        let waf = ScriptFilter::new();
        waf.execute(r#"ngx.shared.cache:set("k", "hello")"#, &request("1.1.1.1", "/"));

        let (blocked, response) = waf.execute(
            r#"
                if ngx.shared.cache:get("k") == "hello" then
                    ngx.say("seen")
                    return ngx.exit(200)
                end
            "#,
            &request("2.2.2.2", "/"),
        );
        assert!(blocked);
        assert_eq!(response.body, "seen");

        // incr over a string value yields nil, not a number.
        let (blocked, _) = waf.execute(
            r#"
                if ngx.shared.cache:incr("k", 1) == nil then
                    return ngx.exit(410)
                end
            "#,
            &request("2.2.2.2", "/"),
        );
        assert!(blocked);
    }

    #[test]
    fn custom_body_and_status() {
        let waf = ScriptFilter::new();
        let script = r#"ngx.status = nil; ngx.say("nope"); return ngx.exit(401)"#;

        let (blocked, response) = waf.execute(script, &request("1.1.1.1", "/"));
        assert!(blocked);
        assert_eq!(response.status_code, 401);
        assert_eq!(response.body, "nope");
    }

    #[test]
    fn say_and_print_append_to_the_body() {
        let waf = ScriptFilter::new();
        let script = r#"
            ngx.say("a")
            ngx.print("b")
            ngx.say("c")
            return ngx.exit(418)
        "#;

        let (_, response) = waf.execute(script, &request("1.1.1.1", "/"));
        assert_eq!(response.body, "abc");
    }

    #[test]
    fn invalid_verdict_types_fall_back_to_defaults() {
        let waf = ScriptFilter::new();
        let script = r#"
            _status_code = "not a number"
            _body = 12345
            _blocked = true
        "#;

        let (blocked, response) = waf.execute(script, &request("1.1.1.1", "/"));
        assert!(blocked);
        assert_eq!(response.status_code, 403);
        assert_eq!(response.body, "Blocked by WAF");
    }

    #[test]
    fn script_errors_do_not_block() {
        let waf = ScriptFilter::new();
        let (blocked, response) = waf.execute("this is not lua", &request("1.1.1.1", "/"));
        assert!(!blocked);
        assert!(response.headers.is_empty());

        let (blocked, _) = waf.execute(r#"error("boom")"#, &request("1.1.1.1", "/"));
        assert!(!blocked);
    }

    #[test]
    fn empty_script_is_a_no_op() {
        let waf = ScriptFilter::new();
        let (blocked, response) = waf.execute("", &request("1.1.1.1", "/"));
        assert!(!blocked);
        assert!(response.headers.is_empty());
    }

    #[test]
    fn user_agent_blocking_via_request_headers() {
        let waf = ScriptFilter::new();
        let script = r#"
            local user_agent = request.headers["User-Agent"] or ""
            local bad_agents = {"bot", "crawler", "scanner"}

            for _, agent in ipairs(bad_agents) do
                if string.find(string.lower(user_agent), agent) then
                    return ngx.exit(403)
                end
            end
        "#;

        let with_agent = |ua: &str| {
            let mut req = request("1.1.1.1", "/");
            req.headers = vec![("User-Agent".to_string(), ua.to_string())];
            req
        };

        for (ua, expect_block) in [
            ("BadBot/1.0", true),
            ("WebCrawler/2.0", true),
            ("Security Scanner", true),
            ("Mozilla/5.0", false),
        ] {
            let (blocked, _) = waf.execute(script, &with_agent(ua));
            assert_eq!(blocked, expect_block, "User-Agent: {ua}");
        }
    }

    #[test]
    fn request_state_does_not_leak_between_pool_leases() {
        let waf = ScriptFilter::new();

        let (blocked, _) = waf.execute("return ngx.exit(403)", &request("1.1.1.1", "/"));
        assert!(blocked);

        // The same pooled instance must come up clean.
        let (blocked, response) = waf.execute("", &request("1.1.1.1", "/"));
        assert!(!blocked);
        assert!(response.headers.is_empty());
    }
}
