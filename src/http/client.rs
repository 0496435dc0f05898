//! HTTP client wrapper: size/validator probe and ranged GETs.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_RANGE,
    LAST_MODIFIED, RANGE, RETRY_AFTER, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;

use super::filename::{filename_from_content_disposition, filename_from_url};
use crate::config::HttpConfig;
use crate::error::{EngineError, ErrorKind};

/// Retry-After values above this are capped.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// What a probe learned about the resource.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub total: Option<u64>,
    pub supports_range: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Server-suggested filename (Content-Disposition), already sanitized.
    pub filename: Option<String>,
}

/// Reusable HTTP client configured from [`HttpConfig`].
///
/// Created once per engine and cloned into download workers; reqwest
/// pools connections underneath.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    user_agent: String,
}

/// Per-request overrides taken from the download record.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

impl HttpClient {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if reqwest rejects the configuration; this
    /// aborts engine startup.
    pub fn build(cfg: &HttpConfig, user_agent: &str) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(cfg.connect_timeout())
            .read_timeout(cfg.read_timeout())
            .redirect(reqwest::redirect::Policy::limited(cfg.max_redirects))
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .gzip(false) // ranged downloads need the raw byte stream
            .build()
            .map_err(|e| {
                EngineError::fatal(ErrorKind::Unknown, format!("building HTTP client: {e}"))
            })?;
        Ok(Self { client, user_agent: user_agent.to_string() })
    }

    /// Learns content length, range support, validators and a suggested
    /// filename. Tries `HEAD` first and falls back to a one-byte ranged
    /// `GET` for servers that reject `HEAD`.
    ///
    /// # Errors
    ///
    /// Returns a classified [`EngineError`]; 4xx other than 405/501 are
    /// surfaced as-is.
    #[instrument(skip(self, options), fields(url))]
    pub async fn probe(&self, url: &str, options: &RequestOptions) -> Result<Probe, EngineError> {
        let parsed = Url::parse(url)
            .map_err(|_| EngineError::fatal(ErrorKind::Unknown, format!("invalid URL: {url}")))?;

        match self.send(self.client.head(url), options, None, None).await {
            Ok(response) if response.status().is_success() => {
                Ok(self.probe_from_head(&parsed, &response))
            }
            Ok(response)
                if matches!(
                    response.status(),
                    StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
                ) =>
            {
                debug!("HEAD rejected, probing with ranged GET");
                self.probe_with_ranged_get(url, &parsed, options).await
            }
            Ok(response) => Err(classify_status(url, &response)),
            Err(_) => {
                // Some servers reset HEAD outright; the ranged GET decides.
                self.probe_with_ranged_get(url, &parsed, options).await
            }
        }
    }

    fn probe_from_head(&self, parsed: &Url, response: &reqwest::Response) -> Probe {
        let headers = response.headers();
        let supports_range = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        Probe {
            total: headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
            supports_range,
            etag: header_string(response, ETAG),
            last_modified: header_string(response, LAST_MODIFIED),
            filename: suggested_filename(parsed, response),
        }
    }

    async fn probe_with_ranged_get(
        &self,
        url: &str,
        parsed: &Url,
        options: &RequestOptions,
    ) -> Result<Probe, EngineError> {
        let response = self
            .send(self.client.get(url), options, Some("bytes=0-0"), None)
            .await?;
        let status = response.status();
        if status == StatusCode::PARTIAL_CONTENT {
            // Content-Range: bytes 0-0/12345
            let total = header_string(&response, CONTENT_RANGE)
                .and_then(|v| v.rsplit_once('/').map(|(_, t)| t.to_string()))
                .and_then(|t| t.parse().ok());
            Ok(Probe {
                total,
                supports_range: true,
                etag: header_string(&response, ETAG),
                last_modified: header_string(&response, LAST_MODIFIED),
                filename: suggested_filename(parsed, &response),
            })
        } else if status.is_success() {
            Ok(Probe {
                total: response.content_length(),
                supports_range: false,
                etag: header_string(&response, ETAG),
                last_modified: header_string(&response, LAST_MODIFIED),
                filename: suggested_filename(parsed, &response),
            })
        } else {
            Err(classify_status(url, &response))
        }
    }

    /// Issues a GET, optionally ranged and conditional on a validator.
    ///
    /// The caller inspects the status: 206 honors the range, 200 after an
    /// `If-Range` means the validator no longer matches.
    ///
    /// # Errors
    ///
    /// Network errors and non-2xx statuses are classified; 200 and 206
    /// are returned for the caller to interpret.
    #[instrument(skip(self, options), fields(url, start, end))]
    pub async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: Option<u64>,
        if_range: Option<&str>,
        options: &RequestOptions,
    ) -> Result<reqwest::Response, EngineError> {
        let range = match end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };
        let response = self
            .send(self.client.get(url), options, Some(&range), if_range)
            .await?;
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT {
            Ok(response)
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE && start == 0 {
            Err(EngineError::fatal(
                ErrorKind::ResumeNotSupported,
                format!("server rejected range 0.. for {url}"),
            ))
        } else {
            Err(classify_status(url, &response))
        }
    }

    /// Plain GET used for sequential (no-range) downloads.
    ///
    /// # Errors
    ///
    /// As for [`get_range`](Self::get_range).
    pub async fn get(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<reqwest::Response, EngineError> {
        let response = self.send(self.client.get(url), options, None, None).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(classify_status(url, &response))
        }
    }

    async fn send(
        &self,
        mut request: reqwest::RequestBuilder,
        options: &RequestOptions,
        range: Option<&str>,
        if_range: Option<&str>,
    ) -> Result<reqwest::Response, EngineError> {
        let ua = options.user_agent.as_deref().unwrap_or(&self.user_agent);
        request = request.header(USER_AGENT, ua);
        if let Some(referrer) = &options.referrer {
            request = request.header(reqwest::header::REFERER, referrer.as_str());
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        if let Some(validator) = if_range {
            request = request.header(IF_RANGE, validator);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::timeout(format!("request timed out: {e}"))
            } else {
                EngineError::network(format!("request failed: {e}"))
            }
        })
    }
}

/// Maps an HTTP error status onto the engine taxonomy.
fn classify_status(url: &str, response: &reqwest::Response) -> EngineError {
    let status = response.status();
    let code = status.as_u16();
    match code {
        401 | 403 | 407 => EngineError::fatal(
            ErrorKind::AuthRequired,
            format!("HTTP {code} for {url}"),
        ),
        404 | 410 => EngineError::not_found(format!("HTTP {code} for {url}")),
        408 => EngineError::timeout(format!("HTTP 408 for {url}")),
        429 => {
            let err = EngineError::network(format!("HTTP 429 for {url}"));
            match retry_after(response) {
                Some(delay) => err.with_retry_after(delay),
                None => err,
            }
        }
        416 => EngineError::fatal(
            ErrorKind::ResumeNotSupported,
            format!("HTTP 416 for {url}"),
        ),
        code if (500..600).contains(&code) => {
            let err = EngineError::network(format!("HTTP {code} for {url}"));
            match retry_after(response) {
                Some(delay) => err.with_retry_after(delay),
                None => err,
            }
        }
        code => EngineError::fatal(ErrorKind::Unknown, format!("HTTP {code} for {url}")),
    }
}

/// Parses a `Retry-After` header: integer seconds or an HTTP-date.
/// Excessive values are capped at one hour.
#[must_use]
pub fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?.trim().to_string();
    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds as u64).min(MAX_RETRY_AFTER));
    }
    if let Ok(date) = httpdate::parse_http_date(&value) {
        return match date.duration_since(std::time::SystemTime::now()) {
            Ok(delay) => Some(delay.min(MAX_RETRY_AFTER)),
            // Date in the past: retry immediately.
            Err(_) => Some(Duration::ZERO),
        };
    }
    warn!(value, "unparseable Retry-After");
    None
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn suggested_filename(url: &Url, response: &reqwest::Response) -> Option<String> {
    let from_header = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_content_disposition);
    from_header.or_else(|| {
        let name = filename_from_url(url);
        (name != "download").then_some(name)
    })
}
