//! One-shot request API over the installed global processor.
//!
//! `get` / `post` / … build a [`Request`], attach the current job context
//! when one is in scope, and hand it to the processor. The call returns as
//! soon as the request is accepted; results arrive through the named
//! callback.

use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;
use crate::context::current_job;
use crate::errors::{Error, Result, ValidationError};
use crate::processor;
use crate::types::{CallbackArgs, HttpHeaders, Method, Request};

/// Options recognized by the one-shot API. Anything left `None` falls back
/// to the configured default.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: Option<HttpHeaders>,
    pub body: Option<String>,
    /// Query parameters merged into the URL.
    pub params: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Callback class name; required.
    pub callback: Option<String>,
    pub callback_args: Option<CallbackArgs>,
    pub raise_error_responses: Option<bool>,
    pub max_redirects: Option<u32>,
}

impl RequestOptions {
    pub fn callback(name: impl Into<String>) -> Self {
        Self {
            callback: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Builds and enqueues a request on the global processor, returning its id.
pub fn request(method: Method, url: &str, options: RequestOptions) -> Result<Uuid> {
    let processor = processor::global()?;
    let request = build_request(method, url, options, processor.config())?;
    processor.enqueue(request)
}

pub fn get(url: &str, options: RequestOptions) -> Result<Uuid> {
    request(Method::Get, url, options)
}

pub fn post(url: &str, options: RequestOptions) -> Result<Uuid> {
    request(Method::Post, url, options)
}

pub fn put(url: &str, options: RequestOptions) -> Result<Uuid> {
    request(Method::Put, url, options)
}

pub fn patch(url: &str, options: RequestOptions) -> Result<Uuid> {
    request(Method::Patch, url, options)
}

pub fn delete(url: &str, options: RequestOptions) -> Result<Uuid> {
    request(Method::Delete, url, options)
}

pub fn head(url: &str, options: RequestOptions) -> Result<Uuid> {
    request(Method::Head, url, options)
}

pub fn options(url: &str, options: RequestOptions) -> Result<Uuid> {
    request(Method::Options, url, options)
}

fn build_request(
    method: Method,
    url: &str,
    options: RequestOptions,
    config: &Config,
) -> Result<Request> {
    let callback = options
        .callback
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| {
            Error::Validation(ValidationError::for_field("callback", "is required"))
        })?;

    let url = apply_params(url, &options.params)?;

    let mut builder = Request::builder(method, url)
        .timeout(options.timeout.unwrap_or(config.timeout))
        .connect_timeout(options.connect_timeout.unwrap_or(config.connect_timeout))
        .max_redirects(options.max_redirects.unwrap_or(config.max_redirects))
        .raise_error_responses(options.raise_error_responses.unwrap_or(false))
        .callback(callback);

    if let Some(headers) = options.headers {
        builder = builder.headers(headers);
    }
    if let Some(body) = options.body {
        builder = builder.body(body);
    }
    if let Some(args) = options.callback_args {
        builder = builder.callback_args(args);
    }
    if let Some(job) = current_job() {
        builder = builder.job_envelope(job.envelope);
    }

    builder.build()
}

fn apply_params(url: &str, params: &[(String, String)]) -> Result<String> {
    if params.is_empty() {
        return Ok(url.to_string());
    }
    let mut parsed = reqwest::Url::parse(url)
        .map_err(|err| Error::Validation(ValidationError::for_field("url", err.to_string())))?;
    parsed
        .query_pairs_mut()
        .extend_pairs(params.iter().map(|(key, value)| (key.as_str(), value.as_str())));
    Ok(parsed.to_string())
}
