//! Cache admission and header mutation rules
//!
//! Configuration conditions embed `$(name)` / `$(name::subkey)` references
//! to request and response state. At startup each reference is replaced by
//! a generated variable and the rewritten text is compiled by [`crate::expr`].
//! Per request, the referenced values are bound into a reusable [`Params`]
//! container and the compiled condition is evaluated to a boolean.

use std::fmt;

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};

use crate::expr::{self, Expr, ExprError, Vars};

/// Recognized `$(…)` reference names. `ReqHeader`, `RespHeader` and
/// `Cookie` require a `::subkey`; the rest forbid one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamName {
    Method,
    Host,
    Path,
    ContentType,
    StatusCode,
    ReqHeader,
    RespHeader,
    Cookie,
}

impl ParamName {
    fn parse(name: &str) -> Option<ParamName> {
        match name {
            "method" => Some(ParamName::Method),
            "host" => Some(ParamName::Host),
            "path" => Some(ParamName::Path),
            "contentType" => Some(ParamName::ContentType),
            "statusCode" => Some(ParamName::StatusCode),
            "req.header" => Some(ParamName::ReqHeader),
            "resp.header" => Some(ParamName::RespHeader),
            "cookie" => Some(ParamName::Cookie),
            _ => None,
        }
    }

    fn requires_sub_key(self) -> bool {
        matches!(
            self,
            ParamName::ReqHeader | ParamName::RespHeader | ParamName::Cookie
        )
    }

    /// Base of the generated variable name.
    fn var_base(self) -> &'static str {
        match self {
            ParamName::Method => "method",
            ParamName::Host => "host",
            ParamName::Path => "path",
            ParamName::ContentType => "contentType",
            ParamName::StatusCode => "statusCode",
            ParamName::ReqHeader => "reqHeader",
            ParamName::RespHeader => "respHeader",
            ParamName::Cookie => "cookie",
        }
    }
}

/// One `$(…)` reference found in a rule, with the variable generated for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleParam {
    pub name: ParamName,
    pub sub_key: Option<String>,
    pub var: String,
}

/// A compiled rule: the condition plus the references it binds.
#[derive(Debug, Clone)]
pub struct Rule {
    expr: Expr,
    pub params: Vec<RuleParam>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleError {
    UnknownParam(String),
    MissingSubKey(String),
    UnexpectedSubKey(String),
    MalformedToken(String),
    InvalidHeaderName(String),
    InvalidHeaderValue(String),
    UnsupportedValueRef(String),
    Compile(ExprError),
    Eval(ExprError),
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::UnknownParam(name) => write!(f, "unknown rule parameter '{}'", name),
            RuleError::MissingSubKey(name) => {
                write!(f, "rule parameter '{}' requires a '::subkey'", name)
            }
            RuleError::UnexpectedSubKey(name) => {
                write!(f, "rule parameter '{}' does not take a '::subkey'", name)
            }
            RuleError::MalformedToken(tok) => write!(f, "malformed rule reference '{}'", tok),
            RuleError::InvalidHeaderName(name) => write!(f, "invalid header name '{}'", name),
            RuleError::InvalidHeaderValue(value) => write!(f, "invalid header value '{}'", value),
            RuleError::UnsupportedValueRef(value) => {
                write!(f, "header value '{}' may only reference $(req.header::NAME)", value)
            }
            RuleError::Compile(e) => write!(f, "could not compile condition: {}", e),
            RuleError::Eval(e) => write!(f, "could not evaluate condition: {}", e),
        }
    }
}

impl std::error::Error for RuleError {}

/// Scan `text` for a `$(…)` reference. Returns the token span and its
/// parsed (name, subkey) on a match.
fn find_reference(text: &str) -> Option<Result<(usize, usize, ParamName, Option<String>), RuleError>> {
    let start = text.find("$(")?;
    let rest = &text[start + 2..];
    let close = match rest.find(')') {
        Some(p) => p,
        None => return Some(Err(RuleError::MalformedToken(text[start..].to_string()))),
    };
    let inner = &rest[..close];
    let end = start + 2 + close + 1;

    let (name_str, sub_key) = match inner.split_once("::") {
        Some((n, s)) => (n, Some(s)),
        None => (inner, None),
    };

    let name = match ParamName::parse(name_str) {
        Some(n) => n,
        None => return Some(Err(RuleError::UnknownParam(name_str.to_string()))),
    };

    if name.requires_sub_key() {
        match sub_key {
            Some(s) if !s.is_empty() => {
                Some(Ok((start, end, name, Some(s.to_string()))))
            }
            _ => Some(Err(RuleError::MissingSubKey(name_str.to_string()))),
        }
    } else if sub_key.is_some() {
        Some(Err(RuleError::UnexpectedSubKey(name_str.to_string())))
    } else {
        Some(Ok((start, end, name, None)))
    }
}

impl Rule {
    /// Compile a rule string. Every `$(…)` occurrence is substituted by a
    /// generated variable; keyed parameters get a fresh, numbered variable
    /// per occurrence so the same header referenced twice yields two
    /// distinct bindings.
    pub fn compile(text: &str) -> Result<Rule, RuleError> {
        let mut rewritten = text.to_string();
        let mut params = Vec::new();
        let mut keyed_seq = 0u32;

        while let Some(found) = find_reference(&rewritten) {
            let (start, end, name, sub_key) = found?;

            let var = if name.requires_sub_key() {
                keyed_seq += 1;
                format!("{}{:02}", name.var_base(), keyed_seq)
            } else {
                name.var_base().to_string()
            };

            rewritten.replace_range(start..end, &var);
            params.push(RuleParam { name, sub_key, var });
        }

        let expr = expr::compile(&rewritten).map_err(RuleError::Compile)?;
        Ok(Rule { expr, params })
    }

    /// Evaluate against bindings previously filled by [`bind`].
    pub fn eval(&self, params: &Params) -> Result<bool, RuleError> {
        self.expr.eval_bool(params).map_err(RuleError::Eval)
    }
}

/// Reusable variable-binding container. Cleared between requests without
/// releasing its backing storage.
#[derive(Debug, Default)]
pub struct Params {
    vals: Vec<(String, String)>,
    len: usize,
}

impl Params {
    pub fn with_capacity(n: usize) -> Params {
        Params {
            vals: Vec::with_capacity(n),
            len: 0,
        }
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }

    pub fn set(&mut self, name: &str, value: &str) {
        if self.len < self.vals.len() {
            let slot = &mut self.vals[self.len];
            slot.0.clear();
            slot.0.push_str(name);
            slot.1.clear();
            slot.1.push_str(value);
        } else {
            self.vals.push((name.to_string(), value.to_string()));
        }
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Vars for Params {
    fn get(&self, name: &str) -> Option<&str> {
        self.vals[..self.len]
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Borrowed view of the request state a rule can reference.
#[derive(Debug, Clone, Copy)]
pub struct RequestCtx<'a> {
    pub method: &'a Method,
    pub host: &'a [u8],
    pub path: &'a [u8],
    pub headers: &'a HeaderMap,
}

/// Borrowed view of the response state a rule can reference.
#[derive(Debug, Clone, Copy)]
pub struct ResponseCtx<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Value of the request cookie `name`, or empty.
fn cookie_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    let raw = header_str(headers, header::COOKIE.as_str());
    for pair in raw.split(';') {
        if let Some((k, v)) = pair.split_once('=') {
            if k.trim() == name {
                return v.trim();
            }
        }
    }
    ""
}

/// Fill `params` with the values referenced by `rule`, taken from the
/// request and (when present) the response. Response-only parameters bind
/// empty when no response is available.
pub fn bind(
    rule: &Rule,
    req: &RequestCtx<'_>,
    resp: Option<&ResponseCtx<'_>>,
    params: &mut Params,
) {
    let mut status_buf = [0u8; 3];

    for p in &rule.params {
        match p.name {
            ParamName::Method => {
                let m = req.method.as_str();
                if m.bytes().any(|b| b.is_ascii_lowercase()) {
                    params.set(&p.var, &m.to_ascii_uppercase());
                } else {
                    params.set(&p.var, m);
                }
            }
            ParamName::Host => {
                params.set(&p.var, std::str::from_utf8(req.host).unwrap_or(""));
            }
            ParamName::Path => {
                params.set(&p.var, std::str::from_utf8(req.path).unwrap_or(""));
            }
            ParamName::ContentType => {
                let v = resp
                    .map(|r| header_str(r.headers, header::CONTENT_TYPE.as_str()))
                    .unwrap_or("");
                params.set(&p.var, v);
            }
            ParamName::StatusCode => match resp {
                Some(r) => {
                    let code = r.status.as_u16();
                    status_buf[0] = b'0' + (code / 100 % 10) as u8;
                    status_buf[1] = b'0' + (code / 10 % 10) as u8;
                    status_buf[2] = b'0' + (code % 10) as u8;
                    let s = std::str::from_utf8(&status_buf).unwrap_or("");
                    params.set(&p.var, s);
                }
                None => params.set(&p.var, ""),
            },
            ParamName::ReqHeader => {
                let key = p.sub_key.as_deref().unwrap_or("");
                params.set(&p.var, header_str(req.headers, key));
            }
            ParamName::RespHeader => {
                let key = p.sub_key.as_deref().unwrap_or("");
                let v = resp.map(|r| header_str(r.headers, key)).unwrap_or("");
                params.set(&p.var, v);
            }
            ParamName::Cookie => {
                let key = p.sub_key.as_deref().unwrap_or("");
                params.set(&p.var, cookie_str(req.headers, key));
            }
        }
    }
}

/// True if any rule matches the given request/response pair.
pub fn check_no_cache(
    rules: &[Rule],
    req: &RequestCtx<'_>,
    resp: Option<&ResponseCtx<'_>>,
    params: &mut Params,
) -> Result<bool, RuleError> {
    for rule in rules {
        params.reset();
        bind(rule, req, resp, params);
        if rule.eval(params)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    Set,
    Unset,
}

/// Value assigned by a `set` header rule: a literal, or the current value
/// of a request header.
#[derive(Debug, Clone)]
enum SetValue {
    Literal(HeaderValue),
    FromRequestHeader(String),
}

/// A rule-gated response header mutation, applied in configuration order
/// to backend responses before they are returned and cached.
#[derive(Debug, Clone)]
pub struct HeaderRule {
    pub action: HeaderAction,
    pub name: HeaderName,
    value: Option<SetValue>,
    when: Option<Rule>,
}

impl HeaderRule {
    pub fn compile(
        action: HeaderAction,
        name: &str,
        value: Option<&str>,
        when: Option<&str>,
    ) -> Result<HeaderRule, RuleError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RuleError::InvalidHeaderName(name.to_string()))?;

        let when = match when {
            Some(text) if !text.is_empty() => Some(Rule::compile(text)?),
            _ => None,
        };

        let value = match (action, value) {
            (HeaderAction::Set, Some(raw)) => Some(Self::parse_value(raw)?),
            (HeaderAction::Set, None) => Some(SetValue::Literal(HeaderValue::from_static(""))),
            (HeaderAction::Unset, _) => None,
        };

        Ok(HeaderRule {
            action,
            name,
            value,
            when,
        })
    }

    fn parse_value(raw: &str) -> Result<SetValue, RuleError> {
        match find_reference(raw) {
            Some(found) => {
                let (_, _, name, sub_key) = found?;
                if name != ParamName::ReqHeader {
                    return Err(RuleError::UnsupportedValueRef(raw.to_string()));
                }
                Ok(SetValue::FromRequestHeader(
                    sub_key.unwrap_or_default(),
                ))
            }
            None => {
                let value = HeaderValue::from_str(raw)
                    .map_err(|_| RuleError::InvalidHeaderValue(raw.to_string()))?;
                Ok(SetValue::Literal(value))
            }
        }
    }

    /// Number of variables this rule binds.
    pub fn params_len(&self) -> usize {
        self.when.as_ref().map(|r| r.params.len()).unwrap_or(0)
    }
}

/// Apply header rules to a backend response's headers.
pub fn apply_header_rules(
    rules: &[HeaderRule],
    req: &RequestCtx<'_>,
    status: StatusCode,
    resp_headers: &mut HeaderMap,
    params: &mut Params,
) -> Result<(), RuleError> {
    for hr in rules {
        if let Some(when) = &hr.when {
            let resp_ctx = ResponseCtx {
                status,
                headers: resp_headers,
            };
            params.reset();
            bind(when, req, Some(&resp_ctx), params);
            if !when.eval(params)? {
                continue;
            }
        }

        match hr.action {
            HeaderAction::Set => {
                let value = match hr.value.as_ref() {
                    Some(SetValue::Literal(v)) => v.clone(),
                    Some(SetValue::FromRequestHeader(key)) => req
                        .headers
                        .get(key.as_str())
                        .cloned()
                        .unwrap_or_else(|| HeaderValue::from_static("")),
                    None => HeaderValue::from_static(""),
                };
                resp_headers.insert(hr.name.clone(), value);
            }
            HeaderAction::Unset => {
                resp_headers.remove(&hr.name);
            }
        }
    }
    Ok(())
}
