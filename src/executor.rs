//! Wire-level request execution on top of a pooled `reqwest` client.
//!
//! The executor owns everything between "the reactor picked up a request"
//! and "we have a terminal value": connection pooling, proxying, the manual
//! redirect walk, the streamed size-capped body read, timeout enforcement,
//! and the classification of every failure into exactly one
//! [`ErrorKind`]. Failures never escape as exceptions; each execution ends
//! in one of the three [`Execution`] arms.

use std::time::Instant;

use futures_util::StreamExt;
use reqwest::header::LOCATION;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::Result;
use crate::types::{
    ErrorKind, ErrorValue, HttpError, HttpHeaders, Method, PayloadBody, RedirectDetails,
    RedirectError, Request, Response, TransportError,
};

/// Terminal outcome of one execution attempt.
#[derive(Debug)]
pub(crate) enum Execution {
    Completed(Response),
    Failed(ErrorValue),
    /// The cooperative cancel fired; the caller re-enqueues the original job
    /// instead of surfacing an error.
    Cancelled,
}

/// Pooled HTTP client shared by every task on the reactor.
pub(crate) struct HttpExecutor {
    client: reqwest::Client,
    max_response_size: usize,
}

impl HttpExecutor {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.idle_connection_timeout)
            .pool_max_idle_per_host(config.max_host_clients)
            .redirect(reqwest::redirect::Policy::none());

        if config.enable_http2 {
            builder = builder.http2_prior_knowledge();
        }

        if let Some(proxy_url) = &config.proxy_url {
            let parsed = reqwest::Url::parse(proxy_url)
                .map_err(|err| crate::errors::Error::Config(format!("invalid proxy url: {err}")))?;
            let mut proxy = reqwest::Proxy::all(proxy_url.as_str())?;
            if !parsed.username().is_empty() {
                proxy = proxy.basic_auth(parsed.username(), parsed.password().unwrap_or_default());
            }
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
            max_response_size: config.max_response_size,
        })
    }

    /// Runs the request to a terminal value. The overall timeout covers
    /// everything from the first connect to the last body byte; cancellation
    /// drops the in-flight exchange, closing its connection.
    pub(crate) async fn execute(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Execution {
        let started = Instant::now();
        tokio::select! {
            _ = cancel.cancelled() => Execution::Cancelled,
            outcome = tokio::time::timeout(request.timeout, self.run(request, started)) => {
                match outcome {
                    Ok(execution) => execution,
                    Err(_) => Execution::Failed(ErrorValue::Transport(transport_error(
                        request,
                        started,
                        ErrorKind::Timeout,
                        format!(
                            "request timeout: no terminal response within {:.3}s",
                            request.timeout.as_secs_f64()
                        ),
                        None,
                    ))),
                }
            }
        }
    }

    async fn run(&self, request: &Request, started: Instant) -> Execution {
        let mut visited = vec![request.url.clone()];
        let mut current_url = request.url.clone();
        let mut current_method = request.method;
        let mut current_body = request
            .body
            .as_ref()
            .and_then(PayloadBody::as_inline)
            .map(str::to_string);

        let response = loop {
            let mut builder = self
                .client
                .request(current_method.to_reqwest(), current_url.as_str());
            for (name, value) in request.headers.iter() {
                builder = builder.header(name, value);
            }
            if let Some(body) = &current_body {
                builder = builder.body(body.clone());
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) => {
                    return Execution::Failed(ErrorValue::Transport(transport_error(
                        request,
                        started,
                        classify(&err),
                        err.to_string(),
                        source_chain(&err).into_iter().next(),
                    )))
                }
            };

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                if let Some(location) = location {
                    let next = match resolve_location(&current_url, &location) {
                        Ok(next) => next,
                        Err(message) => {
                            return Execution::Failed(ErrorValue::Transport(transport_error(
                                request,
                                started,
                                ErrorKind::Redirect,
                                message,
                                None,
                            )))
                        }
                    };

                    let looped = visited.contains(&next);
                    visited.push(next.clone());

                    if looped {
                        return Execution::Failed(ErrorValue::Redirect(
                            RedirectError::RecursiveRedirect(redirect_details(
                                request,
                                started,
                                visited,
                                format!("redirect loop detected at {next}"),
                            )),
                        ));
                    }
                    if visited.len() as u32 - 1 > request.max_redirects {
                        return Execution::Failed(ErrorValue::Redirect(
                            RedirectError::TooManyRedirects(redirect_details(
                                request,
                                started,
                                visited,
                                format!("exceeded {} redirects", request.max_redirects),
                            )),
                        ));
                    }

                    if downgrades_to_get(status.as_u16(), current_method) {
                        current_method = Method::Get;
                        current_body = None;
                    }
                    current_url = next;
                    continue;
                }
                // Redirect status without a Location header: hand the
                // response to the callback as-is.
            }

            break response;
        };

        let status = response.status().as_u16();
        let protocol = format!("{:?}", response.version());
        let headers: HttpHeaders = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut collected: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if collected.len() + bytes.len() > self.max_response_size {
                        return Execution::Failed(ErrorValue::Transport(transport_error(
                            request,
                            started,
                            ErrorKind::ResponseTooLarge,
                            format!(
                                "response body exceeded {} bytes",
                                self.max_response_size
                            ),
                            None,
                        )));
                    }
                    collected.extend_from_slice(&bytes);
                }
                Err(err) => {
                    return Execution::Failed(ErrorValue::Transport(transport_error(
                        request,
                        started,
                        classify(&err),
                        err.to_string(),
                        source_chain(&err).into_iter().next(),
                    )))
                }
            }
        }

        let body = if collected.is_empty() {
            None
        } else {
            Some(PayloadBody::Inline(
                String::from_utf8_lossy(&collected).into_owned(),
            ))
        };

        let response = Response {
            status,
            headers,
            body,
            protocol,
            duration: started.elapsed(),
            request_id: request.id,
            url: request.url.clone(),
            method: request.method,
            callback_args: request.callback_args.clone(),
            redirects: if visited.len() > 1 { visited } else { Vec::new() },
        };

        if request.raise_error_responses && response.status >= 400 {
            return Execution::Failed(ErrorValue::Http(HttpError::from_response(response)));
        }

        Execution::Completed(response)
    }
}

fn resolve_location(current: &str, location: &str) -> std::result::Result<String, String> {
    let base = reqwest::Url::parse(current)
        .map_err(|err| format!("invalid redirect base {current:?}: {err}"))?;
    let next = base
        .join(location)
        .map_err(|err| format!("invalid redirect target {location:?}: {err}"))?;
    Ok(next.to_string())
}

/// 303 always becomes a GET; 301/302 downgrade POST bodies the way browsers
/// (and the pooled client's own policy) do. 307/308 preserve the method.
fn downgrades_to_get(status: u16, method: Method) -> bool {
    match status {
        303 => method != Method::Head,
        301 | 302 => method == Method::Post,
        _ => false,
    }
}

fn transport_error(
    request: &Request,
    started: Instant,
    kind: ErrorKind,
    message: String,
    cause: Option<String>,
) -> TransportError {
    TransportError {
        kind,
        message,
        cause,
        duration: started.elapsed(),
        request_id: request.id,
        url: request.url.clone(),
        method: request.method,
        callback_args: request.callback_args.clone(),
    }
}

fn redirect_details(
    request: &Request,
    started: Instant,
    redirects: Vec<String>,
    message: String,
) -> RedirectDetails {
    RedirectDetails {
        message,
        redirects,
        duration: started.elapsed(),
        request_id: request.id,
        url: request.url.clone(),
        method: request.method,
        callback_args: request.callback_args.clone(),
    }
}

fn source_chain(error: &reqwest::Error) -> Vec<String> {
    let mut chain = Vec::new();
    let mut source = std::error::Error::source(error);
    while let Some(current) = source {
        chain.push(current.to_string().to_ascii_lowercase());
        source = current.source();
    }
    chain
}

/// Maps a transport failure to exactly one kind. When several categories
/// could match, the first in this order wins: timeout, ssl, connection,
/// redirect, protocol, unknown (size-limit breaches are raised directly by
/// the body reader and never reach this function).
pub(crate) fn classify(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        return ErrorKind::Timeout;
    }

    let chain = source_chain(error);
    let chain_has = |needles: &[&str]| {
        chain
            .iter()
            .any(|msg| needles.iter().any(|needle| msg.contains(needle)))
    };

    if chain_has(&["certificate", "tls", "ssl", "handshake"]) {
        return ErrorKind::Ssl;
    }
    if error.is_connect()
        || chain_has(&[
            "connection refused",
            "connection reset",
            "broken pipe",
            "unreachable",
            "connection closed",
            "socket",
        ])
    {
        return ErrorKind::Connection;
    }
    if error.is_redirect() {
        return ErrorKind::Redirect;
    }
    if error.is_body() || error.is_decode() || chain_has(&["invalid", "parse"]) {
        return ErrorKind::Protocol;
    }
    ErrorKind::Unknown
}
