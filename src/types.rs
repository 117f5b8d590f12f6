//! Value model for offloaded HTTP work.
//!
//! Everything in this module is immutable once constructed and serializes to
//! a string-keyed, JSON-safe map via [`as_hash`](Request::as_hash) /
//! [`load`](Request::load) so it can travel through job arguments. Round
//! trips preserve every field, including nested callback args and the
//! ordered redirect list.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{Error, Result, ValidationError};
use crate::queue::JobEnvelope;
use crate::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_REDIRECTS, DEFAULT_REQUEST_TIMEOUT};

/// HTTP method accepted by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Patch,
        Method::Delete,
        Method::Head,
        Method::Options,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Post => "post",
            Method::Put => "put",
            Method::Patch => "patch",
            Method::Delete => "delete",
            Method::Head => "head",
            Method::Options => "options",
        }
    }

    /// Case-insensitive parse; returns `None` for methods the processor does
    /// not accept.
    pub fn parse(value: &str) -> Option<Method> {
        match value.trim().to_ascii_lowercase().as_str() {
            "get" => Some(Method::Get),
            "post" => Some(Method::Post),
            "put" => Some(Method::Put),
            "patch" => Some(Method::Patch),
            "delete" => Some(Method::Delete),
            "head" => Some(Method::Head),
            "options" => Some(Method::Options),
            _ => None,
        }
    }

    /// Whether a request body is permitted for this method.
    pub fn allows_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }

    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a transport-level failure.
///
/// Every error the executor can produce maps to exactly one kind; when more
/// than one category could apply, the first match in declaration order wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    Timeout,
    Connection,
    Ssl,
    Protocol,
    ResponseTooLarge,
    Redirect,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Timeout,
        ErrorKind::Connection,
        ErrorKind::Ssl,
        ErrorKind::Protocol,
        ErrorKind::ResponseTooLarge,
        ErrorKind::Redirect,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Ssl => "ssl",
            ErrorKind::Protocol => "protocol",
            ErrorKind::ResponseTooLarge => "response_too_large",
            ErrorKind::Redirect => "redirect",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "timeout" => ErrorKind::Timeout,
            "connection" => ErrorKind::Connection,
            "ssl" => ErrorKind::Ssl,
            "protocol" => ErrorKind::Protocol,
            "response_too_large" => ErrorKind::ResponseTooLarge,
            "redirect" => ErrorKind::Redirect,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<ErrorKind> for String {
    fn from(value: ErrorKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Case-insensitive header multimap.
///
/// Keys keep the casing of their first occurrence and iterate in insertion
/// order. Serializes as an object mapping name to a string (single value) or
/// an array (repeated header).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpHeaders {
    entries: Vec<(String, Vec<String>)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Adds a value, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Sets a value, replacing any existing values for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1 = vec![value],
            None => self.entries.push((name, vec![value])),
        }
    }

    /// First value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|idx| self.entries[idx].1.first())
            .map(String::as_str)
    }

    /// All values for `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.position(name)
            .map(|idx| self.entries[idx].1.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flattened `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(name, values)| {
            values.iter().map(move |value| (name.as_str(), value.as_str()))
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HttpHeaders {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = HttpHeaders::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

impl Serialize for HttpHeaders {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            if values.len() == 1 {
                map.serialize_entry(name, &values[0])?;
            } else {
                map.serialize_entry(name, values)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HttpHeaders {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as DeError;
        let map = serde_json::Map::<String, Value>::deserialize(deserializer)?;
        let mut headers = HttpHeaders::new();
        for (name, value) in map {
            match value {
                Value::String(single) => headers.append(name, single),
                Value::Array(values) => {
                    for value in values {
                        match value {
                            Value::String(value) => headers.append(name.clone(), value),
                            other => {
                                return Err(DeError::custom(format!(
                                    "header {name:?} has non-string value {other}"
                                )))
                            }
                        }
                    }
                }
                other => {
                    return Err(DeError::custom(format!(
                        "header {name:?} has non-string value {other}"
                    )))
                }
            }
        }
        Ok(headers)
    }
}

/// User-supplied scalar map tunneled alongside a request and handed back to
/// the callback unchanged.
///
/// Values are restricted to JSON scalars (null, bool, number, string) so the
/// map stays job-argument safe. Iteration order is insertion order. There is
/// no mutation API; build a new value instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackArgs {
    entries: serde_json::Map<String, Value>,
}

impl CallbackArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds from a JSON object, rejecting nested arrays or objects.
    pub fn from_map(
        map: serde_json::Map<String, Value>,
    ) -> std::result::Result<Self, ValidationError> {
        for (key, value) in &map {
            if value.is_array() || value.is_object() {
                return Err(ValidationError::for_field(
                    key.clone(),
                    "callback args must be JSON scalars",
                ));
            }
        }
        Ok(Self { entries: map })
    }

    pub fn from_value(value: Value) -> std::result::Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Ok(Self::new()),
            other => Err(ValidationError::new(format!(
                "callback args must be an object, got {other}"
            ))),
        }
    }

    /// Chainable construction helper.
    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> std::result::Result<Self, ValidationError> {
        let key = key.into();
        let value = value.into();
        if value.is_array() || value.is_object() {
            return Err(ValidationError::for_field(
                key,
                "callback args must be JSON scalars",
            ));
        }
        self.entries.insert(key, value);
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn as_map(&self) -> &serde_json::Map<String, Value> {
        &self.entries
    }
}

impl Serialize for CallbackArgs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CallbackArgs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as DeError;
        let map = serde_json::Map::<String, Value>::deserialize(deserializer)?;
        CallbackArgs::from_map(map).map_err(|err| DeError::custom(err.to_string()))
    }
}

/// Request or response body: either inline text or a reference into a
/// payload store for oversized payloads.
///
/// Stored bodies serialize as `{"$ref": {"store": .., "key": ..}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadBody {
    Inline(String),
    Stored { store: String, key: String },
}

impl PayloadBody {
    pub fn inline(text: impl Into<String>) -> Self {
        PayloadBody::Inline(text.into())
    }

    pub fn as_inline(&self) -> Option<&str> {
        match self {
            PayloadBody::Inline(text) => Some(text),
            PayloadBody::Stored { .. } => None,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, PayloadBody::Stored { .. })
    }
}

impl From<String> for PayloadBody {
    fn from(value: String) -> Self {
        PayloadBody::Inline(value)
    }
}

impl From<&str> for PayloadBody {
    fn from(value: &str) -> Self {
        PayloadBody::Inline(value.to_string())
    }
}

impl Serialize for PayloadBody {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            PayloadBody::Inline(text) => serializer.serialize_str(text),
            PayloadBody::Stored { store, key } => {
                let mut outer = serializer.serialize_map(Some(1))?;
                outer.serialize_entry(
                    "$ref",
                    &serde_json::json!({ "store": store, "key": key }),
                )?;
                outer.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PayloadBody {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as DeError;
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(text) => Ok(PayloadBody::Inline(text)),
            Value::Object(map) => {
                let reference = map
                    .get("$ref")
                    .and_then(Value::as_object)
                    .ok_or_else(|| DeError::custom("body object must carry a $ref"))?;
                let store = reference
                    .get("store")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DeError::custom("$ref is missing a store name"))?;
                let key = reference
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DeError::custom("$ref is missing a key"))?;
                Ok(PayloadBody::Stored {
                    store: store.to_string(),
                    key: key.to_string(),
                })
            }
            other => Err(DeError::custom(format!("invalid body value {other}"))),
        }
    }
}

/// Serde helper: durations as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(
                "duration must be a non-negative number of seconds",
            ));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// An outbound HTTP request accepted by the processor.
///
/// Build through [`Request::builder`]; validation happens once at build time
/// and the value is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub method: Method,
    pub url: String,
    #[serde(default, skip_serializing_if = "HttpHeaders::is_empty")]
    pub headers: HttpHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<PayloadBody>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    pub max_redirects: u32,
    #[serde(default)]
    pub raise_error_responses: bool,
    pub callback_class: String,
    #[serde(default, skip_serializing_if = "CallbackArgs::is_empty")]
    pub callback_args: CallbackArgs,
    /// Opaque handle to the originating job, used for re-enqueue on crash or
    /// shutdown. Never inspected beyond `retry_count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_envelope: Option<JobEnvelope>,
}

impl Request {
    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    /// Inline body text, if a body is present and not externally stored.
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_ref().and_then(PayloadBody::as_inline)
    }

    /// Serializes to the neutral string-keyed hash form.
    pub fn as_hash(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Reconstructs from the hash form, re-running construction validation.
    pub fn load(value: Value) -> Result<Request> {
        let request: Request = serde_json::from_value(value)?;
        request.validate()?;
        Ok(request)
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), ValidationError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|err| ValidationError::for_field("url", err.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ValidationError::for_field(
                "url",
                format!("unsupported scheme {:?}", url.scheme()),
            ));
        }
        if !self.method.allows_body() && self.body.is_some() {
            return Err(ValidationError::for_field(
                "body",
                format!("{} requests cannot carry a body", self.method),
            ));
        }
        if self.callback_class.trim().is_empty() {
            return Err(ValidationError::for_field(
                "callback_class",
                "a callback class name is required",
            ));
        }
        if self.timeout.is_zero() {
            return Err(ValidationError::for_field("timeout", "must be positive"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ValidationError::for_field(
                "connect_timeout",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    url: String,
    headers: HttpHeaders,
    body: Option<PayloadBody>,
    timeout: Duration,
    connect_timeout: Duration,
    max_redirects: u32,
    raise_error_responses: bool,
    callback_class: String,
    callback_args: CallbackArgs,
    job_envelope: Option<JobEnvelope>,
}

impl RequestBuilder {
    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HttpHeaders::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            raise_error_responses: false,
            callback_class: String::new(),
            callback_args: CallbackArgs::new(),
            job_envelope: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn headers(mut self, headers: HttpHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<PayloadBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn raise_error_responses(mut self, raise: bool) -> Self {
        self.raise_error_responses = raise;
        self
    }

    pub fn callback(mut self, class_name: impl Into<String>) -> Self {
        self.callback_class = class_name.into();
        self
    }

    pub fn callback_args(mut self, args: CallbackArgs) -> Self {
        self.callback_args = args;
        self
    }

    pub fn job_envelope(mut self, envelope: JobEnvelope) -> Self {
        self.job_envelope = Some(envelope);
        self
    }

    pub fn build(self) -> Result<Request> {
        let request = Request {
            id: Uuid::new_v4(),
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
            connect_timeout: self.connect_timeout,
            max_redirects: self.max_redirects,
            raise_error_responses: self.raise_error_responses,
            callback_class: self.callback_class,
            callback_args: self.callback_args,
            job_envelope: self.job_envelope,
        };
        request.validate()?;
        Ok(request)
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default, skip_serializing_if = "HttpHeaders::is_empty")]
    pub headers: HttpHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<PayloadBody>,
    pub protocol: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub request_id: Uuid,
    pub url: String,
    pub method: Method,
    #[serde(default, skip_serializing_if = "CallbackArgs::is_empty")]
    pub callback_args: CallbackArgs,
    /// Every URL visited while following redirects, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirects: Vec<String>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..=499).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..=599).contains(&self.status)
    }

    /// Inline body text, if the body is present and not externally stored.
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_ref().and_then(PayloadBody::as_inline)
    }

    pub fn as_hash(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn load(value: Value) -> Result<Response> {
        let response: Response = serde_json::from_value(value)?;
        response.validate()?;
        Ok(response)
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), ValidationError> {
        if !(100..=599).contains(&self.status) {
            return Err(ValidationError::for_field(
                "status",
                format!("{} is outside 100..=599", self.status),
            ));
        }
        Ok(())
    }
}

/// Transport-level failure delivered to `on_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
    /// Description of the underlying error chain, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub request_id: Uuid,
    pub url: String,
    pub method: Method,
    #[serde(default, skip_serializing_if = "CallbackArgs::is_empty")]
    pub callback_args: CallbackArgs,
}

impl TransportError {
    pub fn as_hash(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn load(value: Value) -> Result<TransportError> {
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Non-2xx response surfaced as an error because the request opted in via
/// `raise_error_responses`.
///
/// `load` dispatches on the embedded status: 4xx becomes `Client`, 5xx
/// becomes `Server`.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpError {
    Client(Response),
    Server(Response),
}

impl HttpError {
    pub fn from_response(response: Response) -> Self {
        if response.is_client_error() {
            HttpError::Client(response)
        } else {
            HttpError::Server(response)
        }
    }

    pub fn response(&self) -> &Response {
        match self {
            HttpError::Client(response) | HttpError::Server(response) => response,
        }
    }

    pub fn into_response(self) -> Response {
        match self {
            HttpError::Client(response) | HttpError::Server(response) => response,
        }
    }

    pub fn status(&self) -> u16 {
        self.response().status
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            HttpError::Client(_) => "client_error",
            HttpError::Server(_) => "server_error",
        }
    }

    pub fn as_hash(&self) -> Result<Value> {
        Ok(serde_json::json!({
            "error_class": self.error_class(),
            "response": self.response().as_hash()?,
        }))
    }

    pub fn load(value: Value) -> Result<HttpError> {
        let response = value
            .get("response")
            .cloned()
            .ok_or_else(|| ValidationError::for_field("response", "is required"))?;
        let response = Response::load(response)?;
        Ok(HttpError::from_response(response))
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} returned HTTP {}",
            self.response().method,
            self.response().url,
            self.status()
        )
    }
}

/// Shared fields of the redirect-policy failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectDetails {
    pub message: String,
    /// Every URL visited before the policy tripped, in order.
    pub redirects: Vec<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub request_id: Uuid,
    pub url: String,
    pub method: Method,
    #[serde(default, skip_serializing_if = "CallbackArgs::is_empty")]
    pub callback_args: CallbackArgs,
}

/// Redirect-policy violation.
///
/// `load` dispatches on the serialized `error_class` string.
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectError {
    TooManyRedirects(RedirectDetails),
    RecursiveRedirect(RedirectDetails),
}

impl RedirectError {
    pub fn details(&self) -> &RedirectDetails {
        match self {
            RedirectError::TooManyRedirects(details)
            | RedirectError::RecursiveRedirect(details) => details,
        }
    }

    pub fn redirects(&self) -> &[String] {
        &self.details().redirects
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            RedirectError::TooManyRedirects(_) => "too_many_redirects",
            RedirectError::RecursiveRedirect(_) => "recursive_redirect",
        }
    }

    pub fn as_hash(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self.details())?;
        value
            .as_object_mut()
            .expect("redirect details serialize to an object")
            .insert("error_class".to_string(), self.error_class().into());
        Ok(value)
    }

    pub fn load(value: Value) -> Result<RedirectError> {
        let class = value
            .get("error_class")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let details: RedirectDetails = serde_json::from_value(value)?;
        match class.as_str() {
            "too_many_redirects" => Ok(RedirectError::TooManyRedirects(details)),
            "recursive_redirect" => Ok(RedirectError::RecursiveRedirect(details)),
            other => Err(Error::Validation(ValidationError::for_field(
                "error_class",
                format!("unknown redirect error class {other:?}"),
            ))),
        }
    }
}

impl fmt::Display for RedirectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.details().message)
    }
}

/// The value delivered to a callback's `on_error`.
///
/// Serialized blobs carry an `error_class` tag; `load` dispatches on it so a
/// blob always reconstructs the exact variant that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorValue {
    Transport(TransportError),
    Http(HttpError),
    Redirect(RedirectError),
}

impl ErrorValue {
    pub fn error_class(&self) -> &'static str {
        match self {
            ErrorValue::Transport(_) => "transport_error",
            ErrorValue::Http(err) => err.error_class(),
            ErrorValue::Redirect(err) => err.error_class(),
        }
    }

    /// Classification kind: the transport kind, or `redirect` for redirect
    /// failures; HTTP errors have no transport kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ErrorValue::Transport(err) => Some(err.kind),
            ErrorValue::Redirect(_) => Some(ErrorKind::Redirect),
            ErrorValue::Http(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ErrorValue::Transport(err) => err.message.clone(),
            ErrorValue::Http(err) => err.to_string(),
            ErrorValue::Redirect(err) => err.details().message.clone(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            ErrorValue::Transport(err) => err.request_id,
            ErrorValue::Http(err) => err.response().request_id,
            ErrorValue::Redirect(err) => err.details().request_id,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            ErrorValue::Transport(err) => &err.url,
            ErrorValue::Http(err) => &err.response().url,
            ErrorValue::Redirect(err) => &err.details().url,
        }
    }

    pub fn method(&self) -> Method {
        match self {
            ErrorValue::Transport(err) => err.method,
            ErrorValue::Http(err) => err.response().method,
            ErrorValue::Redirect(err) => err.details().method,
        }
    }

    pub fn callback_args(&self) -> &CallbackArgs {
        match self {
            ErrorValue::Transport(err) => &err.callback_args,
            ErrorValue::Http(err) => &err.response().callback_args,
            ErrorValue::Redirect(err) => &err.details().callback_args,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            ErrorValue::Transport(err) => err.duration,
            ErrorValue::Http(err) => err.response().duration,
            ErrorValue::Redirect(err) => err.details().duration,
        }
    }

    pub fn as_hash(&self) -> Result<Value> {
        match self {
            ErrorValue::Transport(err) => {
                let mut value = err.as_hash()?;
                value
                    .as_object_mut()
                    .expect("transport errors serialize to an object")
                    .insert("error_class".to_string(), self.error_class().into());
                Ok(value)
            }
            ErrorValue::Http(err) => err.as_hash(),
            ErrorValue::Redirect(err) => err.as_hash(),
        }
    }

    pub fn load(value: Value) -> Result<ErrorValue> {
        let class = value
            .get("error_class")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match class.as_str() {
            "transport_error" => Ok(ErrorValue::Transport(TransportError::load(value)?)),
            "client_error" | "server_error" => Ok(ErrorValue::Http(HttpError::load(value)?)),
            "too_many_redirects" | "recursive_redirect" => {
                Ok(ErrorValue::Redirect(RedirectError::load(value)?))
            }
            other => Err(Error::Validation(ValidationError::for_field(
                "error_class",
                format!("unknown error class {other:?}"),
            ))),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorValue::Transport(err) => write!(f, "{err}"),
            ErrorValue::Http(err) => write!(f, "{err}"),
            ErrorValue::Redirect(err) => write!(f, "{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn sample_args() -> CallbackArgs {
        CallbackArgs::new()
            .with("webhook_id", "W")
            .unwrap()
            .with("index", 1)
            .unwrap()
    }

    fn sample_response() -> Response {
        Response {
            status: 200,
            headers: [("Content-Type", "application/json")].into_iter().collect(),
            body: Some(PayloadBody::inline("{\"ok\":true}")),
            protocol: "HTTP/1.1".to_string(),
            duration: Duration::from_millis(120),
            request_id: Uuid::new_v4(),
            url: "https://api.example.com/v1/things".to_string(),
            method: Method::Get,
            callback_args: sample_args(),
            redirects: vec![
                "https://api.example.com/v1/things".to_string(),
                "https://api.example.com/v2/things".to_string(),
            ],
        }
    }

    #[test]
    fn method_parse_is_case_insensitive_and_total_over_known_verbs() {
        assert_eq!(Method::parse("GET"), Some(Method::Get));
        assert_eq!(Method::parse(" put "), Some(Method::Put));
        assert_eq!(Method::parse("TRACE"), None);
    }

    #[test]
    fn body_forbidden_for_bodyless_methods() {
        for method in [Method::Get, Method::Delete, Method::Head, Method::Options] {
            let err = Request::builder(method, "https://example.com")
                .callback("Handler")
                .body("nope")
                .build()
                .expect_err("body should be rejected");
            assert!(matches!(err, Error::Validation(_)), "{err}");
        }

        Request::builder(Method::Post, "https://example.com")
            .callback("Handler")
            .body("fine")
            .build()
            .expect("post body should be accepted");
    }

    #[test]
    fn request_requires_absolute_http_url() {
        let relative = Request::builder(Method::Get, "/just/a/path")
            .callback("Handler")
            .build();
        assert!(relative.is_err());

        let ftp = Request::builder(Method::Get, "ftp://example.com/file")
            .callback("Handler")
            .build();
        assert!(ftp.is_err());
    }

    #[test]
    fn request_round_trips_through_hash_form() {
        let request = Request::builder(Method::Post, "https://api.example.com/run")
            .header("Authorization", "Bearer token")
            .header("Accept", "application/json")
            .body("{\"input\":\"hello\"}")
            .timeout(Duration::from_secs_f64(2.5))
            .connect_timeout(Duration::from_millis(750))
            .max_redirects(3)
            .raise_error_responses(true)
            .callback("CompletionHandler")
            .callback_args(sample_args())
            .build()
            .expect("request should build");

        let hash = request.as_hash().expect("as_hash");
        let loaded = Request::load(hash).expect("load");
        assert_eq!(loaded, request);
    }

    #[test]
    fn response_round_trips_including_redirects_and_args() {
        let response = sample_response();
        let hash = response.as_hash().expect("as_hash");
        assert_eq!(hash["status"], json!(200));
        let loaded = Response::load(hash).expect("load");
        assert_eq!(loaded, response);
        assert_eq!(loaded.redirects, response.redirects);
        assert_eq!(loaded.callback_args.get("webhook_id"), Some(&json!("W")));
    }

    #[test]
    fn response_status_predicates() {
        let mut response = sample_response();
        assert!(response.is_success());
        response.status = 404;
        assert!(response.is_client_error());
        assert!(!response.is_server_error());
        response.status = 503;
        assert!(response.is_server_error());
    }

    #[test]
    fn response_load_rejects_out_of_range_status() {
        let mut hash = sample_response().as_hash().unwrap();
        hash["status"] = json!(700);
        assert!(Response::load(hash).is_err());
    }

    #[test]
    fn transport_error_round_trips() {
        let error = TransportError {
            kind: ErrorKind::Timeout,
            message: "request timed out after 0.1s".to_string(),
            cause: Some("operation timed out".to_string()),
            duration: Duration::from_millis(100),
            request_id: Uuid::new_v4(),
            url: "https://slow.example.com/delay".to_string(),
            method: Method::Get,
            callback_args: sample_args(),
        };
        let loaded = TransportError::load(error.as_hash().unwrap()).unwrap();
        assert_eq!(loaded, error);
    }

    #[test]
    fn http_error_load_dispatches_on_status() {
        let mut response = sample_response();
        response.status = 404;
        let client = ErrorValue::Http(HttpError::from_response(response.clone())).as_hash().unwrap();
        assert!(matches!(
            HttpError::load(client).unwrap(),
            HttpError::Client(_)
        ));

        response.status = 500;
        let server = ErrorValue::Http(HttpError::from_response(response)).as_hash().unwrap();
        assert!(matches!(
            HttpError::load(server).unwrap(),
            HttpError::Server(_)
        ));
    }

    #[test]
    fn redirect_error_load_dispatches_on_error_class() {
        let details = RedirectDetails {
            message: "exceeded 3 redirects".to_string(),
            redirects: vec![
                "https://a.example.com/".to_string(),
                "https://b.example.com/".to_string(),
            ],
            duration: Duration::from_millis(40),
            request_id: Uuid::new_v4(),
            url: "https://a.example.com/".to_string(),
            method: Method::Get,
            callback_args: CallbackArgs::new(),
        };

        let too_many = RedirectError::TooManyRedirects(details.clone());
        let loaded = RedirectError::load(too_many.as_hash().unwrap()).unwrap();
        assert_eq!(loaded, too_many);
        assert_eq!(loaded.redirects(), details.redirects.as_slice());

        let recursive = RedirectError::RecursiveRedirect(details);
        let loaded = RedirectError::load(recursive.as_hash().unwrap()).unwrap();
        assert!(matches!(loaded, RedirectError::RecursiveRedirect(_)));
    }

    #[test]
    fn error_value_round_trips_every_variant() {
        let mut response = sample_response();
        response.status = 422;

        let variants = vec![
            ErrorValue::Transport(TransportError {
                kind: ErrorKind::Connection,
                message: "connection refused".to_string(),
                cause: None,
                duration: Duration::from_millis(5),
                request_id: Uuid::new_v4(),
                url: "http://127.0.0.1:1/".to_string(),
                method: Method::Get,
                callback_args: CallbackArgs::new(),
            }),
            ErrorValue::Http(HttpError::from_response(response)),
            ErrorValue::Redirect(RedirectError::RecursiveRedirect(RedirectDetails {
                message: "redirect loop".to_string(),
                redirects: vec!["https://x.example.com/".to_string()],
                duration: Duration::from_millis(9),
                request_id: Uuid::new_v4(),
                url: "https://x.example.com/".to_string(),
                method: Method::Get,
                callback_args: CallbackArgs::new(),
            })),
        ];

        for original in variants {
            let loaded = ErrorValue::load(original.as_hash().unwrap()).unwrap();
            assert_eq!(loaded, original);
        }
    }

    #[test]
    fn callback_args_reject_nested_values() {
        let nested = json!({ "user": { "id": 1 } });
        assert!(CallbackArgs::from_value(nested).is_err());

        let listy = CallbackArgs::new().with("ids", json!([1, 2]));
        assert!(listy.is_err());
    }

    #[test]
    fn callback_args_iterate_in_insertion_order() {
        let args = CallbackArgs::new()
            .with("zeta", 1)
            .unwrap()
            .with("alpha", 2)
            .unwrap()
            .with("mid", 3)
            .unwrap();
        let keys: Vec<&str> = args.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn headers_match_case_insensitively_and_preserve_order() {
        let mut headers = HttpHeaders::new();
        headers.append("Content-Type", "application/json");
        headers.append("X-Trace", "a");
        headers.append("x-trace", "b");

        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get_all("X-TRACE"), ["a", "b"]);
        assert_eq!(headers.len(), 2);

        let names: Vec<&str> = headers.entries.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["Content-Type", "X-Trace"]);
    }

    #[test]
    fn headers_serialize_singles_as_strings_and_repeats_as_arrays() {
        let mut headers = HttpHeaders::new();
        headers.append("Accept", "application/json");
        headers.append("Set-Cookie", "a=1");
        headers.append("Set-Cookie", "b=2");

        let value = serde_json::to_value(&headers).unwrap();
        assert_eq!(value["Accept"], json!("application/json"));
        assert_eq!(value["Set-Cookie"], json!(["a=1", "b=2"]));

        let loaded: HttpHeaders = serde_json::from_value(value).unwrap();
        assert_eq!(loaded, headers);
    }

    #[test]
    fn stored_body_serializes_as_ref() {
        let body = PayloadBody::Stored {
            store: "redis".to_string(),
            key: "abc".to_string(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value, json!({ "$ref": { "store": "redis", "key": "abc" } }));

        let loaded: PayloadBody = serde_json::from_value(value).unwrap();
        assert_eq!(loaded, body);
    }
}
